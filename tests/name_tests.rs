//! The name service and deferred (waiting) lookups.

mod common;

use arbor::client::Client;
use arbor::error::Error;
use common::start_server;
use serde_json::json;
use std::time::Duration;

fn persisted_object(client: &Client) -> arbor::ObjectID {
    let (id, _signature, _instance) = client
        .create_data(&json!({"typename": "arbor::Tensor", "nbytes": 64}))
        .unwrap();
    client.persist(id).unwrap();
    id
}

#[test]
fn test_put_get_drop_name() {
    let server = start_server(|_| {});
    let client = Client::connect(&server.socket).unwrap();
    let id = persisted_object(&client);

    client.put_name(id, "weights").unwrap();
    assert_eq!(client.get_name("weights", false).unwrap(), id);

    client.drop_name("weights").unwrap();
    let err = client.get_name("weights", false).unwrap_err();
    assert!(matches!(err, Error::ObjectNotExists(_)));
}

#[test]
fn test_transient_objects_cannot_be_named() {
    let server = start_server(|_| {});
    let client = Client::connect(&server.socket).unwrap();
    let (id, _, _) = client
        .create_data(&json!({"typename": "arbor::Tensor"}))
        .unwrap();
    assert!(matches!(
        client.put_name(id, "early"),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn test_deferred_get_name_completes_on_put() {
    let server = start_server(|_| {});
    let waiter = Client::connect(&server.socket).unwrap();
    let publisher = Client::connect(&server.socket).unwrap();

    let handle = std::thread::spawn(move || waiter.get_name("pending", true));

    // let the waiter's request get parked server-side
    std::thread::sleep(Duration::from_millis(100));

    let id = persisted_object(&publisher);
    publisher.put_name(id, "pending").unwrap();

    assert_eq!(handle.join().unwrap().unwrap(), id);
}

#[test]
fn test_closed_waiter_is_garbage_collected() {
    use arbor::protocol::{self, StoreType};
    use std::os::unix::net::UnixStream;

    let server = start_server(|_| {});
    let publisher = Client::connect(&server.socket).unwrap();

    // a raw client parks a get_name and then vanishes
    {
        let mut socket = UnixStream::connect(&server.socket).unwrap();
        protocol::write_message(
            &mut socket,
            &protocol::write_register_request(StoreType::Default),
        )
        .unwrap();
        protocol::read_register_reply(&protocol::read_json_message(&mut socket).unwrap()).unwrap();
        protocol::write_message(&mut socket, &protocol::write_get_name_request("never", true))
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let status = publisher.instance_status().unwrap();
        assert_eq!(status["deferred_requests"], 1);
    }

    // give the handler time to notice the closed socket, then trigger a
    // metadata change: the sweep collects the dead request
    std::thread::sleep(Duration::from_millis(100));
    let id = persisted_object(&publisher);
    publisher.put_name(id, "unrelated").unwrap();

    let status = publisher.instance_status().unwrap();
    assert_eq!(status["deferred_requests"], 0);
}

#[test]
fn test_get_data_returns_composite_tree() {
    let server = start_server(|_| {});
    let client = Client::connect(&server.socket).unwrap();

    let (id, _, _) = client
        .create_data(&json!({"typename": "arbor::Pair", "left": 1, "right": 2}))
        .unwrap();
    let content = client.get_data(&[id], false, false).unwrap();
    assert_eq!(content[id.to_hex()]["typename"], "arbor::Pair");
    assert_eq!(content[id.to_hex()]["left"], 1);

    // listing by glob finds it as well
    let listing = client.list_data("arbor::*", false, 10).unwrap();
    assert_eq!(listing[id.to_hex()]["typename"], "arbor::Pair");
}
