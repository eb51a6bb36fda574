use zq::queue::ALL_SLICES;
use zq::{BackendKind, Config, Domain, Queue, API_VERSION};

#[test]
fn falls_back_to_loopback() {
    let config = Config::from_str(
        r#"
        log_level = "debug"

        [loopback]
        max_tx_qlen = 256
        "#,
    )
    .unwrap();
    let _guard = zq::logging::init_log(&config, false);

    let rt = zq::init_with_config(API_VERSION, &config).unwrap();
    let attr = zq::query_attr().unwrap();
    assert_eq!(attr.backend, BackendKind::Software);
    assert_eq!(attr.limits.max_tx_qlen, 256);
    assert!(!zq::is_hardware());

    let dom = Domain::open(rt).unwrap();
    assert!(Queue::allocate(&dom, 512, 4, 0, 0, ALL_SLICES).is_err());
    let q = zq::allocate_queue(&dom, 256, 256, 0, 0, ALL_SLICES).unwrap();
    let i = q.reserve(1).unwrap();
    unsafe { q.no_op(i, false, 7).unwrap() };
    q.commit(i, 1).unwrap();
    let mut out = Vec::new();
    assert_eq!(q.poll(&mut out, 1).unwrap(), 1);
    assert_eq!(out[0].context, 7);
    assert_eq!(zq::status(q.poll(&mut out, 1)), 0);
    zq::free_queue(Some(q)).unwrap();
}
