//! End-to-end blob lifecycle over a real Unix socket.

mod common;

use arbor::client::Client;
use arbor::error::Error;
use arbor::memory::fdpass;
use arbor::protocol::{self, StoreType};
use common::start_server;
use std::os::unix::net::UnixStream;

#[test]
fn test_local_blob_roundtrip() {
    let server = start_server(|_| {});
    let client = Client::connect(&server.socket).unwrap();

    let mut writer = client.create_buffer(16).unwrap();
    let input: Vec<u8> = (0u8..16).collect();
    writer.as_mut_slice().copy_from_slice(&input);
    let id = writer.id();

    client.seal(id).unwrap();

    let buffers = client.get_buffers(&[id]).unwrap();
    assert_eq!(buffers[&id].as_slice(), input.as_slice());

    // drop both local references: the writer's and the reader's
    client.release(id).unwrap();
    client.release(id).unwrap();
    assert!(!client.is_in_use(id).unwrap());
}

#[test]
fn test_get_before_seal_fails() {
    let server = start_server(|_| {});
    let client = Client::connect(&server.socket).unwrap();

    let writer = client.create_buffer(64).unwrap();
    let id = writer.id();

    // another client cannot observe the unsealed blob
    let other = Client::connect(&server.socket).unwrap();
    let err = other.get_buffers(&[id]).unwrap_err();
    assert!(matches!(err, Error::ObjectNotSealed(_)));

    // unless it explicitly opts out of the check
    let buffers = other.get_buffers_unsafe(&[id]).unwrap();
    assert_eq!(buffers[&id].len(), 64);
}

#[test]
fn test_sealed_writes_visible_to_other_clients() {
    let server = start_server(|_| {});
    let writer_client = Client::connect(&server.socket).unwrap();
    let reader_client = Client::connect(&server.socket).unwrap();

    let mut writer = writer_client.create_buffer(4096).unwrap();
    writer.as_mut_slice().fill(0xAB);
    let id = writer.id();
    writer_client.seal(id).unwrap();

    // the reader maps the same arena through its own received fd
    let buffers = reader_client.get_buffers(&[id]).unwrap();
    assert!(buffers[&id].as_slice().iter().all(|&b| b == 0xAB));

    // the writer's mapping stays coherent with later readers
    writer.as_mut_slice()[0] = 0xCD;
    assert_eq!(buffers[&id].as_slice()[0], 0xCD);
}

#[test]
fn test_zero_byte_blob() {
    let server = start_server(|_| {});
    let client = Client::connect(&server.socket).unwrap();

    let writer = client.create_buffer(0).unwrap();
    assert!(writer.is_empty());
    let id = writer.id();

    client.seal(id).unwrap();
    let buffers = client.get_buffers(&[id]).unwrap();
    assert!(buffers[&id].is_empty());
    client.release(id).unwrap();
}

#[test]
fn test_drop_buffer_ignores_references() {
    let server = start_server(|_| {});
    let client = Client::connect(&server.socket).unwrap();

    let writer = client.create_buffer(128).unwrap();
    let id = writer.id();
    client.seal(id).unwrap();
    assert!(client.is_in_use(id).unwrap());

    client.drop_buffer(id).unwrap();
    let err = client.get_buffers(&[id]).unwrap_err();
    assert!(matches!(err, Error::ObjectNotExists(_)));
}

#[test]
fn test_clear_wipes_referenced_and_idle_blobs() {
    let server = start_server(|_| {});
    let holder = Client::connect(&server.socket).unwrap();
    let observer = Client::connect(&server.socket).unwrap();

    // a sealed blob the holder still references
    let mut held = holder.create_buffer(64).unwrap();
    held.as_mut_slice().fill(1);
    let held_id = held.id();
    holder.seal(held_id).unwrap();
    assert!(holder.is_in_use(held_id).unwrap());

    // a sealed blob nobody references
    let idle = holder.create_buffer(64).unwrap();
    let idle_id = idle.id();
    holder.seal(idle_id).unwrap();
    holder.release(idle_id).unwrap();

    // and a composite metadata tree
    let (data_id, _, _) = holder
        .create_data(&serde_json::json!({"typename": "arbor::Tensor"}))
        .unwrap();

    observer.clear().unwrap();

    // the wipe ignores the holder's outstanding dependency
    let err = observer.get_buffers(&[held_id]).unwrap_err();
    assert!(matches!(err, Error::ObjectNotExists(_)));
    let err = observer.get_buffers(&[idle_id]).unwrap_err();
    assert!(matches!(err, Error::ObjectNotExists(_)));
    assert!(!observer.exists(data_id).unwrap());

    let status = observer.instance_status().unwrap();
    assert_eq!(status["memory_usage"], 0);
}

#[test]
fn test_pointer_resolution_over_mapped_blobs() {
    let server = start_server(|_| {});
    let client = Client::connect(&server.socket).unwrap();

    let mut writer = client.create_buffer(512).unwrap();
    writer.as_mut_slice().fill(1);
    let id = writer.id();
    client.seal(id).unwrap();
    let buffers = client.get_buffers(&[id]).unwrap();

    let inside = buffers[&id].as_slice().as_ptr() as usize + 100;
    assert_eq!(client.is_shared_memory(inside), Some(id));
    assert_eq!(client.is_shared_memory(0x10), None);
}

/// Drives the wire protocol by hand to observe the fd dedup that the
/// client library hides: the second buffer in the same arena arrives
/// with `fd == -1` and no ancillary message.
#[test]
fn test_fd_deduplication_on_one_connection() {
    let server = start_server(|_| {});
    let mut socket = UnixStream::connect(&server.socket).unwrap();

    protocol::write_message(
        &mut socket,
        &protocol::write_register_request(StoreType::Default),
    )
    .unwrap();
    let root = protocol::read_json_message(&mut socket).unwrap();
    protocol::read_register_reply(&root).unwrap();

    protocol::write_message(&mut socket, &protocol::write_create_buffer_request(4096)).unwrap();
    let root = protocol::read_json_message(&mut socket).unwrap();
    let (first_id, payload, fd_sent) = protocol::read_create_buffer_reply(&root).unwrap();
    assert_eq!(fd_sent, payload.store_fd);
    // consume the ancillary message carrying the arena fd
    let _arena_fd = fdpass::recv_fd(&socket).unwrap();

    protocol::write_message(&mut socket, &protocol::write_create_buffer_request(4096)).unwrap();
    let root = protocol::read_json_message(&mut socket).unwrap();
    let (second_id, second_payload, fd_sent) = protocol::read_create_buffer_reply(&root).unwrap();
    assert_ne!(first_id, second_id);
    assert_eq!(second_payload.store_fd, payload.store_fd);
    // same arena: the fd is not sent again
    assert_eq!(fd_sent, -1);
}

#[test]
fn test_disk_backed_blob() {
    let server = start_server(|_| {});
    let client = Client::connect(&server.socket).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob.bin");

    let mut writer = client
        .create_disk_buffer(1024, path.to_str().unwrap())
        .unwrap();
    writer.as_mut_slice().fill(0x42);
    let id = writer.id();
    client.seal(id).unwrap();

    let buffers = client.get_buffers(&[id]).unwrap();
    assert!(buffers[&id].as_slice().iter().all(|&b| b == 0x42));

    // the blob is backed by the named file
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);
}

#[test]
fn test_fork_reconnects_with_fresh_state() {
    let server = start_server(|_| {});
    let client = Client::connect(&server.socket).unwrap();

    let writer = client.create_buffer(32).unwrap();
    let id = writer.id();
    client.seal(id).unwrap();

    let forked = client.fork().unwrap();
    assert_eq!(forked.session_id(), client.session_id());
    // usage counts are not replicated: the fork holds no reference
    let err = forked.release(id).unwrap_err();
    assert!(matches!(err, Error::ObjectNotExists(_)));
}

#[test]
fn test_external_arena_carving() {
    let server = start_server(|_| {});
    let client = Client::connect(&server.socket).unwrap();

    let (fd, size, base, space) = client.create_arena(1 << 16).unwrap();
    assert_eq!(size, 1 << 16);

    // carve two blobs by hand inside the reserved arena
    let offsets = [0usize, 8192];
    let sizes = [4096usize, 1024];
    unsafe {
        std::slice::from_raw_parts_mut((space + offsets[0]) as *mut u8, sizes[0]).fill(7);
        std::slice::from_raw_parts_mut((space + offsets[1]) as *mut u8, sizes[1]).fill(9);
    }
    client.release_arena(fd, &offsets, &sizes).unwrap();

    // the carved ranges are now ordinary blobs, named by the server-side
    // address they start at
    let ids: Vec<_> = offsets
        .iter()
        .map(|offset| arbor::ObjectID::from_pointer(base + offset))
        .collect();
    let buffers = client.get_buffers(&ids).unwrap();
    assert_eq!(buffers[&ids[0]].len(), 4096);
    assert!(buffers[&ids[0]].as_slice().iter().all(|&b| b == 7));
    assert!(buffers[&ids[1]].as_slice().iter().all(|&b| b == 9));
}
