//! Streams over the wire: single writer, blocking readers.

mod common;

use arbor::client::Client;
use arbor::error::Error;
use arbor::memory::ObjectID;
use common::start_server;
use std::time::Duration;

const STREAM: ObjectID = ObjectID(0x51);

#[test]
fn test_stream_push_pull_roundtrip() {
    let server = start_server(|_| {});
    let writer = Client::connect(&server.socket).unwrap();
    let reader = Client::connect(&server.socket).unwrap();

    writer.create_stream(STREAM).unwrap();
    writer.open_stream(STREAM, 2).unwrap();
    reader.open_stream(STREAM, 1).unwrap();

    // the reader blocks until a chunk is pushed
    let handle = std::thread::spawn(move || {
        let chunk = reader.pull_next_stream_chunk(STREAM)?;
        let buffers = reader.get_buffers(&[chunk])?;
        Ok::<Vec<u8>, Error>(buffers[&chunk].as_slice().to_vec())
    });
    std::thread::sleep(Duration::from_millis(100));

    let mut chunk = writer.create_buffer(5).unwrap();
    chunk.as_mut_slice().copy_from_slice(b"hello");
    writer.seal(chunk.id()).unwrap();
    writer.push_next_stream_chunk(STREAM, chunk.id()).unwrap();

    assert_eq!(handle.join().unwrap().unwrap(), b"hello");
}

#[test]
fn test_stream_chunks_allocated_by_the_store() {
    let server = start_server(|_| {});
    let writer = Client::connect(&server.socket).unwrap();
    let reader = Client::connect(&server.socket).unwrap();

    writer.create_stream(STREAM).unwrap();

    // the first chunk becomes ready once the second is requested
    let mut first = writer.get_next_stream_chunk(STREAM, 8).unwrap();
    first.as_mut_slice().copy_from_slice(b"chunk001");
    let _second = writer.get_next_stream_chunk(STREAM, 8).unwrap();

    let pulled = reader.pull_next_stream_chunk(STREAM).unwrap();
    assert_eq!(pulled, first.id());
    let buffers = reader.get_buffers_unsafe(&[pulled]).unwrap();
    assert_eq!(buffers[&pulled].as_slice(), b"chunk001");
}

#[test]
fn test_stopped_stream_drains_then_fails() {
    let server = start_server(|_| {});
    let writer = Client::connect(&server.socket).unwrap();
    let reader = Client::connect(&server.socket).unwrap();

    writer.create_stream(STREAM).unwrap();
    let chunk = writer.create_buffer(4).unwrap();
    writer.seal(chunk.id()).unwrap();
    writer.push_next_stream_chunk(STREAM, chunk.id()).unwrap();
    writer.stop_stream(STREAM, false).unwrap();

    // the queued chunk is still deliverable
    assert_eq!(reader.pull_next_stream_chunk(STREAM).unwrap(), chunk.id());
    // then the stream reports itself drained
    let err = reader.pull_next_stream_chunk(STREAM).unwrap_err();
    assert!(matches!(err, Error::StreamDrained));
}

#[test]
fn test_failed_stop_propagates_to_readers() {
    let server = start_server(|_| {});
    let writer = Client::connect(&server.socket).unwrap();
    let reader = Client::connect(&server.socket).unwrap();

    writer.create_stream(STREAM).unwrap();
    writer.stop_stream(STREAM, true).unwrap();

    let err = reader.pull_next_stream_chunk(STREAM).unwrap_err();
    assert!(matches!(err, Error::StreamFailed));
}

#[test]
fn test_reader_disconnect_drops_the_stream() {
    let server = start_server(|_| {});
    let writer = Client::connect(&server.socket).unwrap();
    writer.create_stream(STREAM).unwrap();

    // a subscriber consumes a ready chunk, so its pull returns at once
    // and the connection is now associated with the stream
    let subscriber = Client::connect(&server.socket).unwrap();
    let mut chunk = writer.create_buffer(1).unwrap();
    chunk.as_mut_slice()[0] = 1;
    writer.seal(chunk.id()).unwrap();
    writer.push_next_stream_chunk(STREAM, chunk.id()).unwrap();
    let _ = subscriber.pull_next_stream_chunk(STREAM).unwrap();

    // another reader blocks on the now-empty stream
    let reader = Client::connect(&server.socket).unwrap();
    let blocked = std::thread::spawn(move || {
        let err = reader.pull_next_stream_chunk(STREAM).unwrap_err();
        assert!(matches!(err, Error::StreamFailed));
    });
    std::thread::sleep(Duration::from_millis(100));

    // the subscriber disconnecting drops its streams, which wakes the
    // blocked reader with an error
    drop(subscriber);

    blocked.join().unwrap();
}
