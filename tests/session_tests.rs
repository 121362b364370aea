//! Child sessions and zero-copy ownership handoff between them.

mod common;

use arbor::client::Client;
use arbor::error::Error;
use arbor::memory::ROOT_SESSION_ID;
use arbor::protocol::StoreType;
use common::start_server;
use std::time::Duration;

#[test]
fn test_new_session_listens_on_derived_path() {
    let server = start_server(|_| {});
    let root = Client::connect(&server.socket).unwrap();

    let child_path = root.new_session(StoreType::Default).unwrap();
    assert_ne!(child_path, server.socket.to_string_lossy());
    assert!(child_path.starts_with(&*server.socket.to_string_lossy()));

    let child = Client::connect(&child_path).unwrap();
    assert_ne!(child.session_id(), ROOT_SESSION_ID);

    // the sessions' stores are independent
    let writer = root.create_buffer(64).unwrap();
    root.seal(writer.id()).unwrap();
    let err = child.get_buffers(&[writer.id()]).unwrap_err();
    assert!(matches!(err, Error::ObjectNotExists(_)));
}

#[test]
fn test_ownership_handoff_preserves_bytes() {
    let server = start_server(|_| {});
    let root = Client::connect(&server.socket).unwrap();
    let child_path = root.new_session(StoreType::Default).unwrap();
    let child = Client::connect(&child_path).unwrap();

    // the root session owns a sealed blob with no outstanding references
    let mut writer = root.create_buffer(1024).unwrap();
    writer.as_mut_slice().fill(0x5A);
    let id = writer.id();
    root.seal(id).unwrap();
    root.release(id).unwrap();

    // hand it to the child session under the same id
    child
        .move_buffers_ownership(&[(id, id)], ROOT_SESSION_ID)
        .unwrap();

    // reachable in the child, byte-identical, through the same arena
    let buffers = child.get_buffers(&[id]).unwrap();
    assert!(buffers[&id].as_slice().iter().all(|&b| b == 0x5A));

    // and no longer reachable in the root session
    let err = root.get_buffers(&[id]).unwrap_err();
    assert!(matches!(err, Error::ObjectNotExists(_)));
}

#[test]
fn test_handoff_skips_referenced_payloads() {
    let server = start_server(|_| {});
    let root = Client::connect(&server.socket).unwrap();
    let child_path = root.new_session(StoreType::Default).unwrap();
    let child = Client::connect(&child_path).unwrap();

    // the seal leaves this connection holding a dependency
    let writer = root.create_buffer(64).unwrap();
    let id = writer.id();
    root.seal(id).unwrap();

    child
        .move_buffers_ownership(&[(id, id)], ROOT_SESSION_ID)
        .unwrap();

    // still owned by the root session; the child never saw it
    assert!(root.get_buffers(&[id]).is_ok());
    assert!(matches!(
        child.get_buffers(&[id]),
        Err(Error::ObjectNotExists(_))
    ));
}

#[test]
fn test_handoff_into_plasma_session() {
    let server = start_server(|_| {});
    let root = Client::connect(&server.socket).unwrap();
    let plasma_path = root.new_session(StoreType::Plasma).unwrap();

    let mut writer = root.create_buffer(16).unwrap();
    writer.as_mut_slice().copy_from_slice(b"cross-indexed 16");
    let id = writer.id();
    root.seal(id).unwrap();
    root.release(id).unwrap();

    // drive the move from a plasma client of the target session
    let plasma = arbor::client::PlasmaClient::connect(&plasma_path).unwrap();
    let key = arbor::PlasmaID::new("handoff-key");
    {
        // the move request crosses the plasma session's own socket
        use arbor::protocol::{self, MoveOwnership};
        let mut socket = std::os::unix::net::UnixStream::connect(&plasma_path).unwrap();
        protocol::write_message(
            &mut socket,
            &protocol::write_register_request(arbor::protocol::StoreType::Plasma),
        )
        .unwrap();
        protocol::read_register_reply(&protocol::read_json_message(&mut socket).unwrap()).unwrap();
        let request = MoveOwnership {
            id_to_pid: vec![(id, key.clone())],
            session_id: ROOT_SESSION_ID,
            ..MoveOwnership::default()
        };
        protocol::write_message(
            &mut socket,
            &protocol::write_move_buffers_ownership_request(&request),
        )
        .unwrap();
        protocol::read_move_buffers_ownership_reply(
            &protocol::read_json_message(&mut socket).unwrap(),
        )
        .unwrap();
    }

    let buffers = plasma.get_buffers(&[key.clone()]).unwrap();
    assert_eq!(buffers[&key].as_slice(), b"cross-indexed 16");
}

#[test]
fn test_delete_session_tears_down_on_last_disconnect() {
    let server = start_server(|_| {});
    let root = Client::connect(&server.socket).unwrap();
    let child_path = root.new_session(StoreType::Default).unwrap();

    let child = Client::connect(&child_path).unwrap();
    child.delete_session().unwrap();

    // the acceptor winds down once the last connection is gone
    std::thread::sleep(Duration::from_millis(300));
    assert!(Client::connect(&child_path).is_err());
}
