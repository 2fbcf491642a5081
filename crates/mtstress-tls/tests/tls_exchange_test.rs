//! End-to-end exchanges over rustls.

use std::{fs, sync::Arc};

use mtstress_core::{
    CLIENT_HELLO, Endpoint, Exchange, RunConfig, SERVER_HELLO, SessionContext, SessionLibrary,
    pipe::DEFAULT_CAPACITY, pool,
};
use mtstress_tls::{TlsError, TlsLibrary, TlsLock, TlsSettings};

fn exchange_once(library: &TlsLibrary) -> mtstress_core::ExchangeReport {
    let client = Endpoint::owned(library.client().new_session().unwrap()).unwrap();
    let server = Endpoint::owned(library.server().new_session().unwrap()).unwrap();
    Exchange::new(client, server, DEFAULT_CAPACITY).unwrap().run().unwrap()
}

#[test]
fn pinned_server_exchange() {
    let library = TlsLibrary::new(&TlsSettings::default()).unwrap();
    let report = exchange_once(&library);

    assert_eq!(report.client_received, SERVER_HELLO);
    assert_eq!(report.server_received, CLIENT_HELLO);
    assert!(report.rounds <= 8, "took {} rounds", report.rounds);

    let client = library.client().stats();
    let server = library.server().stats();
    assert_eq!((client.connects, client.connects_good), (1, 1));
    assert_eq!((server.accepts, server.accepts_good), (1, 1));
}

#[test]
fn pipes_smaller_than_a_flight_still_complete() {
    let library = TlsLibrary::new(&TlsSettings::default()).unwrap();

    for capacity in [64, 256, 1024] {
        let client = Endpoint::owned(library.client().new_session().unwrap()).unwrap();
        let server = Endpoint::owned(library.server().new_session().unwrap()).unwrap();
        let report = Exchange::new(client, server, capacity)
            .unwrap()
            .run()
            .unwrap_or_else(|err| panic!("capacity {capacity}: {err}"));

        assert_eq!(report.client_received, SERVER_HELLO);
        assert_eq!(report.server_received, CLIENT_HELLO);
        assert!(report.server_bytes > capacity as u64);
    }
}

#[test]
fn small_pipes_keep_resumption_working() {
    let library = TlsLibrary::new(&TlsSettings::default()).unwrap();
    let mut client = library.client().new_session().unwrap();
    let mut server = library.server().new_session().unwrap();

    for _ in 0..3 {
        let c = Endpoint::borrowed(&mut client).unwrap();
        let s = Endpoint::borrowed(&mut server).unwrap();
        let report = Exchange::new(c, s, 64).unwrap().run().unwrap();
        assert_eq!(report.client_received, SERVER_HELLO);
    }

    assert_eq!(library.server().stats().cache_hits, 2);
}

#[test]
fn client_certificate_is_required_and_accepted() {
    let settings = TlsSettings { client_auth: true, ..TlsSettings::default() };
    let library = TlsLibrary::new(&settings).unwrap();

    let report = exchange_once(&library);
    assert_eq!(report.server_received, CLIENT_HELLO);
}

#[test]
fn reused_handle_resumes_from_server_cache() {
    let library = TlsLibrary::new(&TlsSettings::default()).unwrap();
    let mut client = library.client().new_session().unwrap();
    let mut server = library.server().new_session().unwrap();

    for _ in 0..3 {
        let c = Endpoint::borrowed(&mut client).unwrap();
        let s = Endpoint::borrowed(&mut server).unwrap();
        let report = Exchange::new(c, s, DEFAULT_CAPACITY).unwrap().run().unwrap();
        assert_eq!(report.client_received, SERVER_HELLO);
    }

    let stats = library.server().stats();
    assert_eq!(stats.cache_hits, 2);
    assert_eq!(stats.accepts_good, 3);
}

#[test]
fn fresh_handles_never_resume() {
    let library = TlsLibrary::new(&TlsSettings::default()).unwrap();
    for _ in 0..3 {
        exchange_once(&library);
    }
    assert_eq!(library.server().stats().cache_hits, 0);
}

#[test]
fn server_auth_without_anchors_is_rejected() {
    let settings = TlsSettings { server_auth: true, ..TlsSettings::default() };
    let err = TlsLibrary::new(&settings).unwrap_err();
    assert!(matches!(err, TlsError::NoTrustAnchors("server")));
}

#[test]
fn server_auth_with_ca_file_verifies_loaded_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();

    let identity = dir.path().join("server.pem");
    fs::write(&identity, format!("{}{}", certified.cert.pem(), certified.key_pair.serialize_pem()))
        .unwrap();
    let ca = dir.path().join("ca.pem");
    fs::write(&ca, certified.cert.pem()).unwrap();

    let settings = TlsSettings {
        server_cert: Some(identity),
        ca_file: Some(ca),
        server_auth: true,
        ..TlsSettings::default()
    };
    let library = TlsLibrary::new(&settings).unwrap();
    let report = exchange_once(&library);
    assert_eq!(report.client_received, SERVER_HELLO);
}

#[test]
fn untrusted_server_fails_the_client() {
    let dir = tempfile::tempdir().unwrap();
    let other = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    fs::write(dir.path().join("other.pem"), other.cert.pem()).unwrap();

    let settings = TlsSettings {
        ca_path: Some(dir.path().to_path_buf()),
        server_auth: true,
        ..TlsSettings::default()
    };
    let library = TlsLibrary::new(&settings).unwrap();

    let client = Endpoint::owned(library.client().new_session().unwrap()).unwrap();
    let server = Endpoint::owned(library.server().new_session().unwrap()).unwrap();
    let err = Exchange::new(client, server, DEFAULT_CAPACITY).unwrap().run().unwrap_err();
    assert!(err.to_string().contains("client"), "{err}");

    let errors = library.drain_errors();
    assert!(!errors.is_empty());
}

#[test]
fn pool_run_over_tls() {
    let library = Arc::new(TlsLibrary::new(&TlsSettings::default()).unwrap());
    let report = pool::run(Arc::clone(&library), RunConfig::new(4, 3).with_reuse(true)).unwrap();

    assert!(report.is_success());
    assert_eq!(report.completed_attempts(), 12);
    assert_eq!(report.server.cache_hits, 4 * 2);
    assert!(report.locks.get(TlsLock::SessionCache.id()).unwrap() > 0);
    assert_eq!(report.locks.iter().count(), TlsLock::COUNT);
}
