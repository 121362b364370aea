//! The plasma-indexed store over its own session socket.

mod common;

use arbor::client::{Client, PlasmaClient};
use arbor::error::Error;
use arbor::protocol::StoreType;
use arbor::PlasmaID;
use common::start_server;

fn plasma_session(server: &common::TestServer) -> String {
    let root = Client::connect(&server.socket).unwrap();
    root.new_session(StoreType::Plasma).unwrap()
}

#[test]
fn test_store_type_mismatch_disconnects() {
    let server = start_server(|_| {});
    let path = plasma_session(&server);

    // a default-store client cannot register against a plasma session
    let err = Client::connect(&path).unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));

    // the plasma client can
    assert!(PlasmaClient::connect(&path).is_ok());
}

#[test]
fn test_plasma_blob_roundtrip() {
    let server = start_server(|_| {});
    let client = PlasmaClient::connect(plasma_session(&server)).unwrap();

    let key = PlasmaID::new("sha256:60ad7");
    let mut writer = client.create(key.clone(), 16, 16).unwrap();
    writer.as_mut_slice().copy_from_slice(b"content-addresse");
    assert!(writer.object_id().is_blob());

    client.seal(&key).unwrap();

    let buffers = client.get_buffers(std::slice::from_ref(&key)).unwrap();
    assert_eq!(buffers[&key].as_slice(), b"content-addresse");

    // duplicate keys are rejected
    let err = client.create(key.clone(), 16, 16).unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

#[test]
fn test_plasma_release_deletes_at_zero() {
    let server = start_server(|_| {});
    let path = plasma_session(&server);
    let client = PlasmaClient::connect(&path).unwrap();

    let key = PlasmaID::new("k-release");
    let _writer = client.create(key.clone(), 64, 64).unwrap();
    client.seal(&key).unwrap();

    // one local reference from the create
    client.release(&key).unwrap();

    // the payload is gone server-side
    let other = PlasmaClient::connect(&path).unwrap();
    let err = other.get_buffers(std::slice::from_ref(&key)).unwrap_err();
    assert!(matches!(err, Error::ObjectNotExists(_)));
}

#[test]
fn test_plasma_force_delete() {
    let server = start_server(|_| {});
    let client = PlasmaClient::connect(plasma_session(&server)).unwrap();

    let key = PlasmaID::new("k-delete");
    let _writer = client.create(key.clone(), 64, 64).unwrap();
    client.seal(&key).unwrap();

    client.delete(&key).unwrap();
    let err = client.get_buffers(std::slice::from_ref(&key)).unwrap_err();
    assert!(matches!(err, Error::ObjectNotExists(_)));
}
