//! Eviction of cold payloads to disk and transparent reload.

mod common;

use arbor::client::Client;
use common::start_server;
use tempfile::TempDir;

const MIB: usize = 1 << 20;

fn spill_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// Creates, seals and releases a blob filled with `fill`.
fn sealed_cold_blob(client: &Client, size: usize, fill: u8) -> arbor::ObjectID {
    let mut writer = client.create_buffer(size).unwrap();
    writer.as_mut_slice().fill(fill);
    let id = writer.id();
    client.seal(id).unwrap();
    client.release(id).unwrap();
    id
}

#[test]
fn test_watermark_eviction_and_reload() {
    let dir = spill_dir();
    let server = start_server(|config| {
        config.shared_memory_size = 64 * MIB;
        config.spill_path = Some(dir.path().to_path_buf());
        config.spill_lower_rate = 0.3;
        config.spill_upper_rate = 0.8;
    });
    let client = Client::connect(&server.socket).unwrap();

    // sealed 16 MiB blobs with no clients referencing them; the fourth
    // allocation crosses the 0.8 high watermark and evicts down to 0.3
    let mut ids = Vec::new();
    for index in 0..7u8 {
        ids.push(sealed_cold_blob(&client, 16 * MIB, index + 1));
    }

    let status = client.instance_status().unwrap();
    let usage = status["memory_usage"].as_u64().unwrap() as usize;
    assert!(usage < 19 * MIB, "footprint is {usage} after eviction");

    // the oldest blobs were evicted, one file per blob, named by hex id
    assert!(client.is_spilled(ids[0]).unwrap());
    assert!(client.is_spilled(ids[1]).unwrap());
    assert!(dir.path().join(ids[0].to_hex()).exists());

    // a get transparently reloads the evicted blob
    let buffers = client.get_buffers(&[ids[0]]).unwrap();
    assert!(!client.is_spilled(ids[0]).unwrap());
    assert!(buffers[&ids[0]].as_slice().iter().all(|&b| b == 1));
    assert!(!dir.path().join(ids[0].to_hex()).exists());
}

#[test]
fn test_eviction_makes_room_for_oversized_requests() {
    let dir = spill_dir();
    let server = start_server(|config| {
        config.shared_memory_size = 64 * MIB;
        config.spill_path = Some(dir.path().to_path_buf());
    });
    let client = Client::connect(&server.socket).unwrap();

    let first = sealed_cold_blob(&client, 30 * MIB, 1);
    let _second = sealed_cold_blob(&client, 20 * MIB, 2);

    // 40 MiB cannot fit next to 50 MiB of cold blobs: the store spills
    // before giving up
    let mut writer = client.create_buffer(40 * MIB).unwrap();
    writer.as_mut_slice().fill(3);
    client.seal(writer.id()).unwrap();

    assert!(client.is_spilled(first).unwrap());
}

#[test]
fn test_spilling_disabled_without_a_path() {
    let server = start_server(|config| {
        config.shared_memory_size = 8 * MIB;
        config.spill_path = None;
    });
    let client = Client::connect(&server.socket).unwrap();

    let _cold = sealed_cold_blob(&client, 6 * MIB, 1);
    let err = client.create_buffer(4 * MIB).unwrap_err();
    assert!(matches!(err, arbor::Error::NotEnoughMemory(_)));
}
