//! Wire protocol between clients and the server.
//!
//! Every message is a JSON object carried in a length-prefixed frame:
//!
//! ```text
//! [ u64 little-endian length ] [ length bytes of UTF-8 JSON ]
//! ```
//!
//! Each object carries a `"type"` string from the closed command taxonomy.
//! Replies use `"<op>_reply"` as their type, or an error envelope
//! `{"code": u32, "message": String}`. File descriptors never travel in
//! the JSON; replies only list the integer fd values that will follow as
//! ancillary messages so both ends can cross-check them.
//!
//! The header value is bounded at 64 MiB; an oversized or unparseable
//! frame closes the connection without a reply.

use crate::error::{Error, Result};
use crate::memory::{InstanceID, ObjectID, Payload, PlasmaID, PlasmaPayload, SessionID};
use serde_json::{Value, json};
use std::io::{Read, Write};

/// Hard limit for a single message body.
pub const MAX_MESSAGE_SIZE: u64 = 64 << 20;

/// The crate's semantic version, exchanged during registration.
pub fn server_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Which bulk-store flavour a session serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    /// Object-id indexed store.
    #[default]
    Default,
    /// Plasma-id indexed store.
    Plasma,
}

impl StoreType {
    /// The wire name of this store type.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreType::Default => "Normal",
            StoreType::Plasma => "Plasma",
        }
    }

    /// Accepts both the string names and the legacy numeric encoding.
    pub fn from_value(value: &Value) -> StoreType {
        match value {
            Value::Number(n) if n.as_u64() == Some(2) => StoreType::Plasma,
            Value::String(s) if s == "Plasma" => StoreType::Plasma,
            _ => StoreType::Default,
        }
    }
}

// ---------------------------------------------------------------------------
// framing

/// Write one framed message.
pub fn write_message<W: Write>(writer: &mut W, body: &str) -> Result<()> {
    let length = body.len() as u64;
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(body.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read one framed message body.
///
/// Fails with [`Error::Invalid`] when the header exceeds the hard limit;
/// the caller is expected to close the connection without replying.
pub fn read_message<R: Read>(reader: &mut R) -> Result<String> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header)?;
    let length = u64::from_le_bytes(header);
    if length > MAX_MESSAGE_SIZE {
        return Err(Error::Invalid(format!(
            "message header exceeds the limit: {length} bytes"
        )));
    }
    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body)?;
    String::from_utf8(body).map_err(|e| Error::Invalid(format!("message is not UTF-8: {e}")))
}

/// Read one framed message and parse it as JSON.
pub fn read_json_message<R: Read>(reader: &mut R) -> Result<Value> {
    let body = read_message(reader)?;
    serde_json::from_str(&body).map_err(|e| Error::Invalid(format!("malformed message: {e}")))
}

fn encode(root: Value) -> String {
    root.to_string()
}

// ---------------------------------------------------------------------------
// command taxonomy

/// The closed set of request commands the server dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Register,
    NewSession,
    DeleteSession,
    GetData,
    ListData,
    CreateData,
    Persist,
    Exists,
    IfPersist,
    ShallowCopy,
    DelData,
    DelDataWithFeedbacks,
    CreateBuffer,
    CreateDiskBuffer,
    CreateGpuBuffer,
    CreateRemoteBuffer,
    CreateBufferByPlasma,
    GetBuffers,
    GetRemoteBuffers,
    GetGpuBuffers,
    GetBuffersByPlasma,
    DropBuffer,
    Seal,
    PlasmaSeal,
    Release,
    PlasmaRelease,
    PlasmaDelData,
    IncreaseReferenceCount,
    IsInUse,
    IsSpilled,
    MoveBuffersOwnership,
    MakeArena,
    FinalizeArena,
    CreateStream,
    OpenStream,
    GetNextStreamChunk,
    PushNextStreamChunk,
    PullNextStreamChunk,
    StopStream,
    PutName,
    GetName,
    DropName,
    MigrateObject,
    ClusterMeta,
    InstanceStatus,
    Clear,
    Debug,
    Exit,
    /// Anything not in the taxonomy.
    Null,
}

impl Command {
    /// Map a `"type"` string onto the taxonomy.
    pub fn parse(kind: &str) -> Command {
        match kind {
            "register_request" => Command::Register,
            "new_session_request" => Command::NewSession,
            "delete_session_request" => Command::DeleteSession,
            "get_data_request" => Command::GetData,
            "list_data_request" => Command::ListData,
            "create_data_request" => Command::CreateData,
            "persist_request" => Command::Persist,
            "exists_request" => Command::Exists,
            "if_persist_request" => Command::IfPersist,
            "shallow_copy_request" => Command::ShallowCopy,
            "del_data_request" => Command::DelData,
            "del_data_with_feedbacks_request" => Command::DelDataWithFeedbacks,
            "create_buffer_request" => Command::CreateBuffer,
            "create_disk_buffer_request" => Command::CreateDiskBuffer,
            "create_gpu_buffer_request" => Command::CreateGpuBuffer,
            "create_remote_buffer_request" => Command::CreateRemoteBuffer,
            "create_buffer_by_plasma_request" => Command::CreateBufferByPlasma,
            "get_buffers_request" => Command::GetBuffers,
            "get_remote_buffers_request" => Command::GetRemoteBuffers,
            "get_gpu_buffers_request" => Command::GetGpuBuffers,
            "get_buffers_by_plasma_request" => Command::GetBuffersByPlasma,
            "drop_buffer_request" => Command::DropBuffer,
            "seal_request" => Command::Seal,
            "plasma_seal_request" => Command::PlasmaSeal,
            "release_request" => Command::Release,
            "plasma_release_request" => Command::PlasmaRelease,
            "plasma_delete_data_request" => Command::PlasmaDelData,
            "increase_reference_count_request" => Command::IncreaseReferenceCount,
            "is_in_use_request" => Command::IsInUse,
            "is_spilled_request" => Command::IsSpilled,
            "move_buffers_ownership_request" => Command::MoveBuffersOwnership,
            "make_arena_request" => Command::MakeArena,
            "finalize_arena_request" => Command::FinalizeArena,
            "create_stream_request" => Command::CreateStream,
            "open_stream_request" => Command::OpenStream,
            "get_next_stream_chunk_request" => Command::GetNextStreamChunk,
            "push_next_stream_chunk_request" => Command::PushNextStreamChunk,
            "pull_next_stream_chunk_request" => Command::PullNextStreamChunk,
            "stop_stream_request" => Command::StopStream,
            "put_name_request" => Command::PutName,
            "get_name_request" => Command::GetName,
            "drop_name_request" => Command::DropName,
            "migrate_object_request" => Command::MigrateObject,
            "cluster_meta" => Command::ClusterMeta,
            "instance_status_request" => Command::InstanceStatus,
            "clear_request" => Command::Clear,
            "debug_command" => Command::Debug,
            "exit_request" => Command::Exit,
            _ => Command::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// field helpers

fn expect_type(root: &Value, kind: &str) -> Result<()> {
    if root["type"] == kind {
        Ok(())
    } else {
        Err(Error::Invalid(format!(
            "expected message of type '{}', got '{}'",
            kind, root["type"]
        )))
    }
}

fn get_u64(root: &Value, key: &str) -> Result<u64> {
    root[key]
        .as_u64()
        .ok_or_else(|| Error::Invalid(format!("missing or non-integer field '{key}'")))
}

fn get_i64(root: &Value, key: &str) -> Result<i64> {
    root[key]
        .as_i64()
        .ok_or_else(|| Error::Invalid(format!("missing or non-integer field '{key}'")))
}

fn get_usize(root: &Value, key: &str) -> Result<usize> {
    Ok(get_u64(root, key)? as usize)
}

fn get_str(root: &Value, key: &str) -> Result<String> {
    root[key]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| Error::Invalid(format!("missing or non-string field '{key}'")))
}

fn get_object_id(root: &Value, key: &str) -> Result<ObjectID> {
    Ok(ObjectID(get_u64(root, key)?))
}

fn get_bool_or(root: &Value, key: &str, default: bool) -> bool {
    root[key].as_bool().unwrap_or(default)
}

fn get_id_vec(root: &Value, key: &str) -> Result<Vec<ObjectID>> {
    serde_json::from_value(root[key].clone())
        .map_err(|e| Error::Invalid(format!("malformed id list '{key}': {e}")))
}

/// Surface a wire error envelope, if present.
pub fn check_wire_error(root: &Value) -> Result<()> {
    if let Some(code) = root["code"].as_u64() {
        if code != 0 {
            let message = root["message"].as_str().unwrap_or_default().to_owned();
            return Err(Error::from_wire(code as u32, message));
        }
    }
    Ok(())
}

fn check_reply(root: &Value, kind: &str) -> Result<()> {
    check_wire_error(root)?;
    expect_type(root, kind)
}

/// Encode an error reply envelope.
pub fn write_error_reply(err: &Error) -> String {
    encode(json!({"code": err.code(), "message": err.to_string()}))
}

// ---------------------------------------------------------------------------
// register / exit / sessions

pub fn write_register_request(store_type: StoreType) -> String {
    encode(json!({
        "type": "register_request",
        "version": server_version(),
        "store_type": store_type.as_str(),
    }))
}

pub fn read_register_request(root: &Value) -> Result<(String, StoreType)> {
    expect_type(root, "register_request")?;
    // a missing version means an unknown legacy client
    let version = root["version"].as_str().unwrap_or("0.0.0").to_owned();
    let store_type = StoreType::from_value(&root["store_type"]);
    Ok((version, store_type))
}

/// The server's half of the registration handshake.
#[derive(Debug, Clone)]
pub struct RegisterReply {
    pub ipc_socket: String,
    pub rpc_endpoint: String,
    pub instance_id: InstanceID,
    pub session_id: SessionID,
    pub version: String,
    pub store_match: bool,
}

pub fn write_register_reply(reply: &RegisterReply) -> String {
    encode(json!({
        "type": "register_reply",
        "ipc_socket": reply.ipc_socket,
        "rpc_endpoint": reply.rpc_endpoint,
        "instance_id": reply.instance_id,
        "session_id": reply.session_id,
        "version": reply.version,
        "store_match": reply.store_match,
    }))
}

pub fn read_register_reply(root: &Value) -> Result<RegisterReply> {
    check_reply(root, "register_reply")?;
    Ok(RegisterReply {
        ipc_socket: get_str(root, "ipc_socket")?,
        rpc_endpoint: get_str(root, "rpc_endpoint")?,
        instance_id: get_u64(root, "instance_id")?,
        session_id: get_i64(root, "session_id")?,
        version: root["version"].as_str().unwrap_or("0.0.0").to_owned(),
        store_match: get_bool_or(root, "store_match", false),
    })
}

pub fn write_exit_request() -> String {
    encode(json!({"type": "exit_request"}))
}

pub fn write_new_session_request(store_type: StoreType) -> String {
    encode(json!({
        "type": "new_session_request",
        "bulk_store_type": store_type.as_str(),
    }))
}

pub fn read_new_session_request(root: &Value) -> Result<StoreType> {
    expect_type(root, "new_session_request")?;
    Ok(StoreType::from_value(&root["bulk_store_type"]))
}

pub fn write_new_session_reply(socket_path: &str) -> String {
    encode(json!({"type": "new_session_reply", "socket_path": socket_path}))
}

pub fn read_new_session_reply(root: &Value) -> Result<String> {
    check_reply(root, "new_session_reply")?;
    get_str(root, "socket_path")
}

pub fn write_delete_session_request() -> String {
    encode(json!({"type": "delete_session_request"}))
}

pub fn write_delete_session_reply() -> String {
    encode(json!({"type": "delete_session_reply"}))
}

pub fn read_delete_session_reply(root: &Value) -> Result<()> {
    check_reply(root, "delete_session_reply")
}

// ---------------------------------------------------------------------------
// buffers

pub fn write_create_buffer_request(size: usize) -> String {
    encode(json!({"type": "create_buffer_request", "size": size}))
}

pub fn read_create_buffer_request(root: &Value) -> Result<usize> {
    expect_type(root, "create_buffer_request")?;
    get_usize(root, "size")
}

fn buffer_reply(kind: &str, id: ObjectID, payload: &Payload, fd_to_send: i32) -> String {
    encode(json!({
        "type": kind,
        "id": id,
        "fd": fd_to_send,
        "created": serde_json::to_value(payload).expect("payloads always serialize"),
    }))
}

pub fn write_create_buffer_reply(id: ObjectID, payload: &Payload, fd_to_send: i32) -> String {
    buffer_reply("create_buffer_reply", id, payload, fd_to_send)
}

fn read_buffer_reply(root: &Value, kind: &str) -> Result<(ObjectID, Payload, i32)> {
    check_reply(root, kind)?;
    let id = get_object_id(root, "id")?;
    let payload: Payload = serde_json::from_value(root["created"].clone())
        .map_err(|e| Error::Invalid(format!("malformed payload descriptor: {e}")))?;
    let fd_sent = root["fd"].as_i64().unwrap_or(-1) as i32;
    Ok((id, payload, fd_sent))
}

pub fn read_create_buffer_reply(root: &Value) -> Result<(ObjectID, Payload, i32)> {
    read_buffer_reply(root, "create_buffer_reply")
}

pub fn write_create_disk_buffer_request(size: usize, path: &str) -> String {
    encode(json!({"type": "create_disk_buffer_request", "size": size, "path": path}))
}

pub fn read_create_disk_buffer_request(root: &Value) -> Result<(usize, String)> {
    expect_type(root, "create_disk_buffer_request")?;
    Ok((get_usize(root, "size")?, get_str(root, "path")?))
}

pub fn write_create_disk_buffer_reply(id: ObjectID, payload: &Payload, fd_to_send: i32) -> String {
    buffer_reply("create_disk_buffer_reply", id, payload, fd_to_send)
}

pub fn read_create_disk_buffer_reply(root: &Value) -> Result<(ObjectID, Payload, i32)> {
    read_buffer_reply(root, "create_disk_buffer_reply")
}

pub fn write_create_remote_buffer_request(size: usize) -> String {
    encode(json!({"type": "create_remote_buffer_request", "size": size}))
}

pub fn read_create_remote_buffer_request(root: &Value) -> Result<usize> {
    expect_type(root, "create_remote_buffer_request")?;
    get_usize(root, "size")
}

pub fn write_create_gpu_buffer_request(size: usize) -> String {
    encode(json!({"type": "create_gpu_buffer_request", "size": size}))
}

pub fn read_create_gpu_buffer_request(root: &Value) -> Result<usize> {
    expect_type(root, "create_gpu_buffer_request")?;
    get_usize(root, "size")
}

/// GPU replies substitute an opaque IPC handle vector for the arena fd;
/// the mappings themselves are not interpreted here.
pub fn write_create_gpu_buffer_reply(id: ObjectID, payload: &Payload, handle: &[i64]) -> String {
    encode(json!({
        "type": "create_gpu_buffer_reply",
        "id": id,
        "handle": handle,
        "created": serde_json::to_value(payload).expect("payloads always serialize"),
    }))
}

pub fn read_create_gpu_buffer_reply(root: &Value) -> Result<(ObjectID, Payload, Vec<i64>)> {
    check_reply(root, "create_gpu_buffer_reply")?;
    let id = get_object_id(root, "id")?;
    let payload: Payload = serde_json::from_value(root["created"].clone())
        .map_err(|e| Error::Invalid(format!("malformed payload descriptor: {e}")))?;
    let handle: Vec<i64> = serde_json::from_value(root["handle"].clone())
        .map_err(|e| Error::Invalid(format!("malformed handle vector: {e}")))?;
    Ok((id, payload, handle))
}

pub fn write_get_gpu_buffers_reply(payloads: &[Payload], handles: &[Vec<i64>]) -> String {
    let mut root = json!({
        "type": "get_gpu_buffers_reply",
        "num": payloads.len(),
        "handles": handles,
    });
    for (index, payload) in payloads.iter().enumerate() {
        root[index.to_string()] =
            serde_json::to_value(payload).expect("payloads always serialize");
    }
    encode(root)
}

pub fn read_get_gpu_buffers_reply(root: &Value) -> Result<(Vec<Payload>, Vec<Vec<i64>>)> {
    check_reply(root, "get_gpu_buffers_reply")?;
    let num = root["num"].as_u64().unwrap_or(0) as usize;
    let mut payloads = Vec::with_capacity(num);
    for index in 0..num {
        let payload: Payload = serde_json::from_value(root[index.to_string()].clone())
            .map_err(|e| Error::Invalid(format!("malformed payload descriptor: {e}")))?;
        payloads.push(payload);
    }
    let handles: Vec<Vec<i64>> = if root["handles"].is_array() {
        serde_json::from_value(root["handles"].clone())
            .map_err(|e| Error::Invalid(format!("malformed handle vectors: {e}")))?
    } else {
        Vec::new()
    };
    Ok((payloads, handles))
}

fn write_indexed_ids(kind: &str, ids: &[ObjectID], unsafe_get: bool) -> String {
    let mut root = json!({"type": kind, "num": ids.len(), "unsafe": unsafe_get});
    for (index, id) in ids.iter().enumerate() {
        root[index.to_string()] = json!(id);
    }
    encode(root)
}

fn read_indexed_ids(root: &Value) -> Result<(Vec<ObjectID>, bool)> {
    let num = get_usize(root, "num")?;
    let mut ids = Vec::with_capacity(num);
    for index in 0..num {
        ids.push(get_object_id(root, &index.to_string())?);
    }
    Ok((ids, get_bool_or(root, "unsafe", false)))
}

pub fn write_get_buffers_request(ids: &[ObjectID], unsafe_get: bool) -> String {
    write_indexed_ids("get_buffers_request", ids, unsafe_get)
}

pub fn read_get_buffers_request(root: &Value) -> Result<(Vec<ObjectID>, bool)> {
    expect_type(root, "get_buffers_request")?;
    read_indexed_ids(root)
}

pub fn write_get_buffers_reply(payloads: &[Payload], fds_to_send: &[i32]) -> String {
    let mut root = json!({
        "type": "get_buffers_reply",
        "num": payloads.len(),
        "fds": fds_to_send,
    });
    for (index, payload) in payloads.iter().enumerate() {
        root[index.to_string()] =
            serde_json::to_value(payload).expect("payloads always serialize");
    }
    encode(root)
}

pub fn read_get_buffers_reply(root: &Value) -> Result<(Vec<Payload>, Vec<i32>)> {
    check_reply(root, "get_buffers_reply")?;
    let num = root["num"].as_u64().unwrap_or(0) as usize;
    let mut payloads = Vec::with_capacity(num);
    for index in 0..num {
        let payload: Payload = serde_json::from_value(root[index.to_string()].clone())
            .map_err(|e| Error::Invalid(format!("malformed payload descriptor: {e}")))?;
        payloads.push(payload);
    }
    let fds = if root["fds"].is_array() {
        serde_json::from_value(root["fds"].clone())
            .map_err(|e| Error::Invalid(format!("malformed fd list: {e}")))?
    } else {
        Vec::new()
    };
    Ok((payloads, fds))
}

pub fn write_get_remote_buffers_request(ids: &[ObjectID], unsafe_get: bool) -> String {
    write_indexed_ids("get_remote_buffers_request", ids, unsafe_get)
}

pub fn read_get_remote_buffers_request(root: &Value) -> Result<(Vec<ObjectID>, bool)> {
    expect_type(root, "get_remote_buffers_request")?;
    read_indexed_ids(root)
}

pub fn write_get_gpu_buffers_request(ids: &[ObjectID], unsafe_get: bool) -> String {
    write_indexed_ids("get_gpu_buffers_request", ids, unsafe_get)
}

pub fn read_get_gpu_buffers_request(root: &Value) -> Result<(Vec<ObjectID>, bool)> {
    expect_type(root, "get_gpu_buffers_request")?;
    read_indexed_ids(root)
}

pub fn write_drop_buffer_request(id: ObjectID) -> String {
    encode(json!({"type": "drop_buffer_request", "id": id}))
}

pub fn read_drop_buffer_request(root: &Value) -> Result<ObjectID> {
    expect_type(root, "drop_buffer_request")?;
    get_object_id(root, "id")
}

pub fn write_drop_buffer_reply() -> String {
    encode(json!({"type": "drop_buffer_reply"}))
}

pub fn read_drop_buffer_reply(root: &Value) -> Result<()> {
    check_reply(root, "drop_buffer_reply")
}

// ---------------------------------------------------------------------------
// plasma buffers

pub fn write_create_buffer_by_plasma_request(
    plasma_id: &PlasmaID,
    size: usize,
    plasma_size: usize,
) -> String {
    encode(json!({
        "type": "create_buffer_by_plasma_request",
        "plasma_id": plasma_id,
        "size": size,
        "plasma_size": plasma_size,
    }))
}

pub fn read_create_buffer_by_plasma_request(root: &Value) -> Result<(PlasmaID, usize, usize)> {
    expect_type(root, "create_buffer_by_plasma_request")?;
    Ok((
        PlasmaID::new(get_str(root, "plasma_id")?),
        get_usize(root, "size")?,
        get_usize(root, "plasma_size")?,
    ))
}

pub fn write_create_buffer_by_plasma_reply(
    id: ObjectID,
    payload: &PlasmaPayload,
    fd_to_send: i32,
) -> String {
    encode(json!({
        "type": "create_buffer_by_plasma_reply",
        "id": id,
        "fd": fd_to_send,
        "created": serde_json::to_value(payload).expect("payloads always serialize"),
    }))
}

pub fn read_create_buffer_by_plasma_reply(root: &Value) -> Result<(ObjectID, PlasmaPayload, i32)> {
    check_reply(root, "create_buffer_by_plasma_reply")?;
    let id = get_object_id(root, "id")?;
    let payload: PlasmaPayload = serde_json::from_value(root["created"].clone())
        .map_err(|e| Error::Invalid(format!("malformed payload descriptor: {e}")))?;
    let fd_sent = root["fd"].as_i64().unwrap_or(-1) as i32;
    Ok((id, payload, fd_sent))
}

pub fn write_get_buffers_by_plasma_request(plasma_ids: &[PlasmaID], unsafe_get: bool) -> String {
    let mut root = json!({
        "type": "get_buffers_by_plasma_request",
        "num": plasma_ids.len(),
        "unsafe": unsafe_get,
    });
    for (index, pid) in plasma_ids.iter().enumerate() {
        root[index.to_string()] = json!(pid);
    }
    encode(root)
}

pub fn read_get_buffers_by_plasma_request(root: &Value) -> Result<(Vec<PlasmaID>, bool)> {
    expect_type(root, "get_buffers_by_plasma_request")?;
    let num = get_usize(root, "num")?;
    let mut ids = Vec::with_capacity(num);
    for index in 0..num {
        ids.push(PlasmaID::new(get_str(root, &index.to_string())?));
    }
    Ok((ids, get_bool_or(root, "unsafe", false)))
}

pub fn write_get_buffers_by_plasma_reply(payloads: &[PlasmaPayload]) -> String {
    let mut root = json!({
        "type": "get_buffers_by_plasma_reply",
        "num": payloads.len(),
    });
    for (index, payload) in payloads.iter().enumerate() {
        root[index.to_string()] =
            serde_json::to_value(payload).expect("payloads always serialize");
    }
    encode(root)
}

pub fn read_get_buffers_by_plasma_reply(root: &Value) -> Result<Vec<PlasmaPayload>> {
    check_reply(root, "get_buffers_by_plasma_reply")?;
    let num = root["num"].as_u64().unwrap_or(0) as usize;
    let mut payloads = Vec::with_capacity(num);
    for index in 0..num {
        let payload: PlasmaPayload = serde_json::from_value(root[index.to_string()].clone())
            .map_err(|e| Error::Invalid(format!("malformed payload descriptor: {e}")))?;
        payloads.push(payload);
    }
    Ok(payloads)
}

// ---------------------------------------------------------------------------
// seal / release / observers

pub fn write_seal_request(object_id: ObjectID) -> String {
    encode(json!({"type": "seal_request", "object_id": object_id}))
}

pub fn read_seal_request(root: &Value) -> Result<ObjectID> {
    expect_type(root, "seal_request")?;
    get_object_id(root, "object_id")
}

pub fn write_plasma_seal_request(plasma_id: &PlasmaID) -> String {
    encode(json!({"type": "plasma_seal_request", "plasma_id": plasma_id}))
}

pub fn read_plasma_seal_request(root: &Value) -> Result<PlasmaID> {
    expect_type(root, "plasma_seal_request")?;
    Ok(PlasmaID::new(get_str(root, "plasma_id")?))
}

pub fn write_seal_reply() -> String {
    encode(json!({"type": "seal_reply"}))
}

pub fn read_seal_reply(root: &Value) -> Result<()> {
    check_reply(root, "seal_reply")
}

pub fn write_release_request(object_id: ObjectID) -> String {
    encode(json!({"type": "release_request", "object_id": object_id}))
}

pub fn read_release_request(root: &Value) -> Result<ObjectID> {
    expect_type(root, "release_request")?;
    get_object_id(root, "object_id")
}

pub fn write_release_reply() -> String {
    encode(json!({"type": "release_reply"}))
}

pub fn read_release_reply(root: &Value) -> Result<()> {
    check_reply(root, "release_reply")
}

pub fn write_plasma_release_request(plasma_id: &PlasmaID) -> String {
    encode(json!({"type": "plasma_release_request", "plasma_id": plasma_id}))
}

pub fn read_plasma_release_request(root: &Value) -> Result<PlasmaID> {
    expect_type(root, "plasma_release_request")?;
    Ok(PlasmaID::new(get_str(root, "plasma_id")?))
}

pub fn write_plasma_release_reply() -> String {
    encode(json!({"type": "plasma_release_reply"}))
}

pub fn read_plasma_release_reply(root: &Value) -> Result<()> {
    check_reply(root, "plasma_release_reply")
}

pub fn write_plasma_del_data_request(plasma_id: &PlasmaID) -> String {
    encode(json!({"type": "plasma_delete_data_request", "plasma_id": plasma_id}))
}

pub fn read_plasma_del_data_request(root: &Value) -> Result<PlasmaID> {
    expect_type(root, "plasma_delete_data_request")?;
    Ok(PlasmaID::new(get_str(root, "plasma_id")?))
}

pub fn write_plasma_del_data_reply() -> String {
    encode(json!({"type": "plasma_delete_data_reply"}))
}

pub fn read_plasma_del_data_reply(root: &Value) -> Result<()> {
    check_reply(root, "plasma_delete_data_reply")
}

pub fn write_increase_reference_count_request(ids: &[ObjectID]) -> String {
    encode(json!({"type": "increase_reference_count_request", "ids": ids}))
}

pub fn read_increase_reference_count_request(root: &Value) -> Result<Vec<ObjectID>> {
    expect_type(root, "increase_reference_count_request")?;
    get_id_vec(root, "ids")
}

pub fn write_increase_reference_count_reply() -> String {
    encode(json!({"type": "increase_reference_count_reply"}))
}

pub fn read_increase_reference_count_reply(root: &Value) -> Result<()> {
    check_reply(root, "increase_reference_count_reply")
}

pub fn write_is_in_use_request(id: ObjectID) -> String {
    encode(json!({"type": "is_in_use_request", "id": id}))
}

pub fn read_is_in_use_request(root: &Value) -> Result<ObjectID> {
    expect_type(root, "is_in_use_request")?;
    get_object_id(root, "id")
}

pub fn write_is_in_use_reply(is_in_use: bool) -> String {
    encode(json!({"type": "is_in_use_reply", "is_in_use": is_in_use}))
}

pub fn read_is_in_use_reply(root: &Value) -> Result<bool> {
    check_reply(root, "is_in_use_reply")?;
    Ok(get_bool_or(root, "is_in_use", false))
}

pub fn write_is_spilled_request(id: ObjectID) -> String {
    encode(json!({"type": "is_spilled_request", "id": id}))
}

pub fn read_is_spilled_request(root: &Value) -> Result<ObjectID> {
    expect_type(root, "is_spilled_request")?;
    get_object_id(root, "id")
}

pub fn write_is_spilled_reply(is_spilled: bool) -> String {
    encode(json!({"type": "is_spilled_reply", "is_spilled": is_spilled}))
}

pub fn read_is_spilled_reply(root: &Value) -> Result<bool> {
    check_reply(root, "is_spilled_reply")?;
    Ok(get_bool_or(root, "is_spilled", false))
}

// ---------------------------------------------------------------------------
// ownership movement

/// The id mappings of a `move_buffers_ownership_request`. At most one of
/// the four direction lists is non-empty per request; each pairs a source
/// id with the id the payload should carry in the target session.
#[derive(Debug, Clone, Default)]
pub struct MoveOwnership {
    pub id_to_id: Vec<(ObjectID, ObjectID)>,
    pub id_to_pid: Vec<(ObjectID, PlasmaID)>,
    pub pid_to_id: Vec<(PlasmaID, ObjectID)>,
    pub pid_to_pid: Vec<(PlasmaID, PlasmaID)>,
    pub session_id: SessionID,
}

pub fn write_move_buffers_ownership_request(request: &MoveOwnership) -> String {
    let mut root = json!({
        "type": "move_buffers_ownership_request",
        "session_id": request.session_id,
    });
    if !request.id_to_id.is_empty() {
        root["id_to_id"] = json!(request.id_to_id);
    }
    if !request.id_to_pid.is_empty() {
        root["id_to_pid"] = json!(request.id_to_pid);
    }
    if !request.pid_to_id.is_empty() {
        root["pid_to_id"] = json!(request.pid_to_id);
    }
    if !request.pid_to_pid.is_empty() {
        root["pid_to_pid"] = json!(request.pid_to_pid);
    }
    encode(root)
}

fn pair_list<A, B>(root: &Value, key: &str) -> Result<Vec<(A, B)>>
where
    A: serde::de::DeserializeOwned,
    B: serde::de::DeserializeOwned,
{
    if root[key].is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(root[key].clone())
        .map_err(|e| Error::Invalid(format!("malformed mapping '{key}': {e}")))
}

pub fn read_move_buffers_ownership_request(root: &Value) -> Result<MoveOwnership> {
    expect_type(root, "move_buffers_ownership_request")?;
    Ok(MoveOwnership {
        id_to_id: pair_list(root, "id_to_id")?,
        id_to_pid: pair_list(root, "id_to_pid")?,
        pid_to_id: pair_list(root, "pid_to_id")?,
        pid_to_pid: pair_list(root, "pid_to_pid")?,
        session_id: get_i64(root, "session_id")?,
    })
}

pub fn write_move_buffers_ownership_reply() -> String {
    encode(json!({"type": "move_buffers_ownership_reply"}))
}

pub fn read_move_buffers_ownership_reply(root: &Value) -> Result<()> {
    check_reply(root, "move_buffers_ownership_reply")
}

// ---------------------------------------------------------------------------
// external arenas

pub fn write_make_arena_request(size: usize) -> String {
    encode(json!({"type": "make_arena_request", "size": size}))
}

pub fn read_make_arena_request(root: &Value) -> Result<usize> {
    expect_type(root, "make_arena_request")?;
    get_usize(root, "size")
}

pub fn write_make_arena_reply(fd: i32, size: usize, base: usize) -> String {
    encode(json!({"type": "make_arena_reply", "fd": fd, "size": size, "base": base}))
}

pub fn read_make_arena_reply(root: &Value) -> Result<(i32, usize, usize)> {
    check_reply(root, "make_arena_reply")?;
    Ok((
        get_i64(root, "fd")? as i32,
        get_usize(root, "size")?,
        get_usize(root, "base")?,
    ))
}

pub fn write_finalize_arena_request(fd: i32, offsets: &[usize], sizes: &[usize]) -> String {
    encode(json!({
        "type": "finalize_arena_request",
        "fd": fd,
        "offsets": offsets,
        "sizes": sizes,
    }))
}

pub fn read_finalize_arena_request(root: &Value) -> Result<(i32, Vec<usize>, Vec<usize>)> {
    expect_type(root, "finalize_arena_request")?;
    let fd = get_i64(root, "fd")? as i32;
    let offsets: Vec<usize> = serde_json::from_value(root["offsets"].clone())
        .map_err(|e| Error::Invalid(format!("malformed offsets: {e}")))?;
    let sizes: Vec<usize> = serde_json::from_value(root["sizes"].clone())
        .map_err(|e| Error::Invalid(format!("malformed sizes: {e}")))?;
    Ok((fd, offsets, sizes))
}

pub fn write_finalize_arena_reply() -> String {
    encode(json!({"type": "finalize_arena_reply"}))
}

pub fn read_finalize_arena_reply(root: &Value) -> Result<()> {
    check_reply(root, "finalize_arena_reply")
}

// ---------------------------------------------------------------------------
// metadata plane

pub fn write_get_data_request(ids: &[ObjectID], sync_remote: bool, wait: bool) -> String {
    encode(json!({
        "type": "get_data_request",
        "id": ids,
        "sync_remote": sync_remote,
        "wait": wait,
    }))
}

pub fn read_get_data_request(root: &Value) -> Result<(Vec<ObjectID>, bool, bool)> {
    expect_type(root, "get_data_request")?;
    Ok((
        get_id_vec(root, "id")?,
        get_bool_or(root, "sync_remote", false),
        get_bool_or(root, "wait", false),
    ))
}

pub fn write_get_data_reply(content: &Value) -> String {
    encode(json!({"type": "get_data_reply", "content": content}))
}

pub fn read_get_data_reply(root: &Value) -> Result<Value> {
    check_reply(root, "get_data_reply")?;
    Ok(root["content"].clone())
}

pub fn write_list_data_request(pattern: &str, regex: bool, limit: usize) -> String {
    encode(json!({
        "type": "list_data_request",
        "pattern": pattern,
        "regex": regex,
        "limit": limit,
    }))
}

pub fn read_list_data_request(root: &Value) -> Result<(String, bool, usize)> {
    expect_type(root, "list_data_request")?;
    Ok((
        get_str(root, "pattern")?,
        get_bool_or(root, "regex", false),
        get_usize(root, "limit")?,
    ))
}

pub fn write_create_data_request(content: &Value) -> String {
    encode(json!({"type": "create_data_request", "content": content}))
}

pub fn read_create_data_request(root: &Value) -> Result<Value> {
    expect_type(root, "create_data_request")?;
    Ok(root["content"].clone())
}

pub fn write_create_data_reply(id: ObjectID, signature: u64, instance_id: InstanceID) -> String {
    encode(json!({
        "type": "create_data_reply",
        "id": id,
        "signature": signature,
        "instance_id": instance_id,
    }))
}

pub fn read_create_data_reply(root: &Value) -> Result<(ObjectID, u64, InstanceID)> {
    check_reply(root, "create_data_reply")?;
    Ok((
        get_object_id(root, "id")?,
        get_u64(root, "signature")?,
        get_u64(root, "instance_id")?,
    ))
}

pub fn write_persist_request(id: ObjectID) -> String {
    encode(json!({"type": "persist_request", "id": id}))
}

pub fn read_persist_request(root: &Value) -> Result<ObjectID> {
    expect_type(root, "persist_request")?;
    get_object_id(root, "id")
}

pub fn write_persist_reply() -> String {
    encode(json!({"type": "persist_reply"}))
}

pub fn read_persist_reply(root: &Value) -> Result<()> {
    check_reply(root, "persist_reply")
}

pub fn write_if_persist_request(id: ObjectID) -> String {
    encode(json!({"type": "if_persist_request", "id": id}))
}

pub fn read_if_persist_request(root: &Value) -> Result<ObjectID> {
    expect_type(root, "if_persist_request")?;
    get_object_id(root, "id")
}

pub fn write_if_persist_reply(persist: bool) -> String {
    encode(json!({"type": "if_persist_reply", "persist": persist}))
}

pub fn read_if_persist_reply(root: &Value) -> Result<bool> {
    check_reply(root, "if_persist_reply")?;
    Ok(get_bool_or(root, "persist", false))
}

pub fn write_exists_request(id: ObjectID) -> String {
    encode(json!({"type": "exists_request", "id": id}))
}

pub fn read_exists_request(root: &Value) -> Result<ObjectID> {
    expect_type(root, "exists_request")?;
    get_object_id(root, "id")
}

pub fn write_exists_reply(exists: bool) -> String {
    encode(json!({"type": "exists_reply", "exists": exists}))
}

pub fn read_exists_reply(root: &Value) -> Result<bool> {
    check_reply(root, "exists_reply")?;
    Ok(get_bool_or(root, "exists", false))
}

pub fn write_shallow_copy_request(id: ObjectID, extra: &Value) -> String {
    encode(json!({"type": "shallow_copy_request", "id": id, "extra": extra}))
}

pub fn read_shallow_copy_request(root: &Value) -> Result<(ObjectID, Value)> {
    expect_type(root, "shallow_copy_request")?;
    let extra = if root["extra"].is_null() {
        json!({})
    } else {
        root["extra"].clone()
    };
    Ok((get_object_id(root, "id")?, extra))
}

pub fn write_shallow_copy_reply(target_id: ObjectID) -> String {
    encode(json!({"type": "shallow_copy_reply", "target_id": target_id}))
}

pub fn read_shallow_copy_reply(root: &Value) -> Result<ObjectID> {
    check_reply(root, "shallow_copy_reply")?;
    get_object_id(root, "target_id")
}

pub fn write_del_data_request(ids: &[ObjectID], force: bool, deep: bool, fastpath: bool) -> String {
    encode(json!({
        "type": "del_data_request",
        "id": ids,
        "force": force,
        "deep": deep,
        "fastpath": fastpath,
    }))
}

pub fn read_del_data_request(root: &Value) -> Result<(Vec<ObjectID>, bool, bool, bool)> {
    expect_type(root, "del_data_request")?;
    Ok((
        get_id_vec(root, "id")?,
        get_bool_or(root, "force", false),
        get_bool_or(root, "deep", false),
        get_bool_or(root, "fastpath", false),
    ))
}

pub fn write_del_data_reply() -> String {
    encode(json!({"type": "del_data_reply"}))
}

pub fn read_del_data_reply(root: &Value) -> Result<()> {
    check_reply(root, "del_data_reply")
}

pub fn write_del_data_with_feedbacks_request(
    ids: &[ObjectID],
    force: bool,
    deep: bool,
    fastpath: bool,
) -> String {
    encode(json!({
        "type": "del_data_with_feedbacks_request",
        "id": ids,
        "force": force,
        "deep": deep,
        "fastpath": fastpath,
    }))
}

pub fn read_del_data_with_feedbacks_request(
    root: &Value,
) -> Result<(Vec<ObjectID>, bool, bool, bool)> {
    expect_type(root, "del_data_with_feedbacks_request")?;
    Ok((
        get_id_vec(root, "id")?,
        get_bool_or(root, "force", false),
        get_bool_or(root, "deep", false),
        get_bool_or(root, "fastpath", false),
    ))
}

pub fn write_del_data_with_feedbacks_reply(deleted_bids: &[ObjectID]) -> String {
    encode(json!({
        "type": "del_data_with_feedbacks_reply",
        "deleted_bids": deleted_bids,
    }))
}

pub fn read_del_data_with_feedbacks_reply(root: &Value) -> Result<Vec<ObjectID>> {
    check_reply(root, "del_data_with_feedbacks_reply")?;
    get_id_vec(root, "deleted_bids")
}

// ---------------------------------------------------------------------------
// names

pub fn write_put_name_request(object_id: ObjectID, name: &str) -> String {
    encode(json!({"type": "put_name_request", "object_id": object_id, "name": name}))
}

pub fn read_put_name_request(root: &Value) -> Result<(ObjectID, String)> {
    expect_type(root, "put_name_request")?;
    Ok((get_object_id(root, "object_id")?, get_str(root, "name")?))
}

pub fn write_put_name_reply() -> String {
    encode(json!({"type": "put_name_reply"}))
}

pub fn read_put_name_reply(root: &Value) -> Result<()> {
    check_reply(root, "put_name_reply")
}

pub fn write_get_name_request(name: &str, wait: bool) -> String {
    encode(json!({"type": "get_name_request", "name": name, "wait": wait}))
}

pub fn read_get_name_request(root: &Value) -> Result<(String, bool)> {
    expect_type(root, "get_name_request")?;
    Ok((get_str(root, "name")?, get_bool_or(root, "wait", false)))
}

pub fn write_get_name_reply(object_id: ObjectID) -> String {
    encode(json!({"type": "get_name_reply", "object_id": object_id}))
}

pub fn read_get_name_reply(root: &Value) -> Result<ObjectID> {
    check_reply(root, "get_name_reply")?;
    get_object_id(root, "object_id")
}

pub fn write_drop_name_request(name: &str) -> String {
    encode(json!({"type": "drop_name_request", "name": name}))
}

pub fn read_drop_name_request(root: &Value) -> Result<String> {
    expect_type(root, "drop_name_request")?;
    get_str(root, "name")
}

pub fn write_drop_name_reply() -> String {
    encode(json!({"type": "drop_name_reply"}))
}

pub fn read_drop_name_reply(root: &Value) -> Result<()> {
    check_reply(root, "drop_name_reply")
}

// ---------------------------------------------------------------------------
// streams

pub fn write_create_stream_request(object_id: ObjectID) -> String {
    encode(json!({"type": "create_stream_request", "object_id": object_id}))
}

pub fn read_create_stream_request(root: &Value) -> Result<ObjectID> {
    expect_type(root, "create_stream_request")?;
    get_object_id(root, "object_id")
}

pub fn write_create_stream_reply() -> String {
    encode(json!({"type": "create_stream_reply"}))
}

pub fn read_create_stream_reply(root: &Value) -> Result<()> {
    check_reply(root, "create_stream_reply")
}

pub fn write_open_stream_request(object_id: ObjectID, mode: i64) -> String {
    encode(json!({"type": "open_stream_request", "object_id": object_id, "mode": mode}))
}

pub fn read_open_stream_request(root: &Value) -> Result<(ObjectID, i64)> {
    expect_type(root, "open_stream_request")?;
    Ok((get_object_id(root, "object_id")?, get_i64(root, "mode")?))
}

pub fn write_open_stream_reply() -> String {
    encode(json!({"type": "open_stream_reply"}))
}

pub fn read_open_stream_reply(root: &Value) -> Result<()> {
    check_reply(root, "open_stream_reply")
}

pub fn write_get_next_stream_chunk_request(stream_id: ObjectID, size: usize) -> String {
    encode(json!({"type": "get_next_stream_chunk_request", "id": stream_id, "size": size}))
}

pub fn read_get_next_stream_chunk_request(root: &Value) -> Result<(ObjectID, usize)> {
    expect_type(root, "get_next_stream_chunk_request")?;
    Ok((get_object_id(root, "id")?, get_usize(root, "size")?))
}

pub fn write_get_next_stream_chunk_reply(payload: &Payload, fd_to_send: i32) -> String {
    encode(json!({
        "type": "get_next_stream_chunk_reply",
        "buffer": serde_json::to_value(payload).expect("payloads always serialize"),
        "fd": fd_to_send,
    }))
}

pub fn read_get_next_stream_chunk_reply(root: &Value) -> Result<(Payload, i32)> {
    check_reply(root, "get_next_stream_chunk_reply")?;
    let payload: Payload = serde_json::from_value(root["buffer"].clone())
        .map_err(|e| Error::Invalid(format!("malformed payload descriptor: {e}")))?;
    let fd_sent = root["fd"].as_i64().unwrap_or(-1) as i32;
    Ok((payload, fd_sent))
}

pub fn write_push_next_stream_chunk_request(stream_id: ObjectID, chunk: ObjectID) -> String {
    encode(json!({"type": "push_next_stream_chunk_request", "id": stream_id, "chunk": chunk}))
}

pub fn read_push_next_stream_chunk_request(root: &Value) -> Result<(ObjectID, ObjectID)> {
    expect_type(root, "push_next_stream_chunk_request")?;
    Ok((get_object_id(root, "id")?, get_object_id(root, "chunk")?))
}

pub fn write_push_next_stream_chunk_reply() -> String {
    encode(json!({"type": "push_next_stream_chunk_reply"}))
}

pub fn read_push_next_stream_chunk_reply(root: &Value) -> Result<()> {
    check_reply(root, "push_next_stream_chunk_reply")
}

pub fn write_pull_next_stream_chunk_request(stream_id: ObjectID) -> String {
    encode(json!({"type": "pull_next_stream_chunk_request", "id": stream_id}))
}

pub fn read_pull_next_stream_chunk_request(root: &Value) -> Result<ObjectID> {
    expect_type(root, "pull_next_stream_chunk_request")?;
    get_object_id(root, "id")
}

pub fn write_pull_next_stream_chunk_reply(chunk: ObjectID) -> String {
    encode(json!({"type": "pull_next_stream_chunk_reply", "chunk": chunk}))
}

pub fn read_pull_next_stream_chunk_reply(root: &Value) -> Result<ObjectID> {
    check_reply(root, "pull_next_stream_chunk_reply")?;
    get_object_id(root, "chunk")
}

pub fn write_stop_stream_request(stream_id: ObjectID, failed: bool) -> String {
    encode(json!({"type": "stop_stream_request", "id": stream_id, "failed": failed}))
}

pub fn read_stop_stream_request(root: &Value) -> Result<(ObjectID, bool)> {
    expect_type(root, "stop_stream_request")?;
    Ok((get_object_id(root, "id")?, get_bool_or(root, "failed", false)))
}

pub fn write_stop_stream_reply() -> String {
    encode(json!({"type": "stop_stream_reply"}))
}

pub fn read_stop_stream_reply(root: &Value) -> Result<()> {
    check_reply(root, "stop_stream_reply")
}

// ---------------------------------------------------------------------------
// miscellany

pub fn write_migrate_object_request(object_id: ObjectID) -> String {
    encode(json!({"type": "migrate_object_request", "object_id": object_id}))
}

pub fn write_cluster_meta_request() -> String {
    encode(json!({"type": "cluster_meta"}))
}

pub fn write_cluster_meta_reply(meta: &Value) -> String {
    encode(json!({"type": "cluster_meta", "meta": meta}))
}

pub fn read_cluster_meta_reply(root: &Value) -> Result<Value> {
    check_reply(root, "cluster_meta")?;
    Ok(root["meta"].clone())
}

pub fn write_instance_status_request() -> String {
    encode(json!({"type": "instance_status_request"}))
}

pub fn write_instance_status_reply(meta: &Value) -> String {
    encode(json!({"type": "instance_status_reply", "meta": meta}))
}

pub fn read_instance_status_reply(root: &Value) -> Result<Value> {
    check_reply(root, "instance_status_reply")?;
    Ok(root["meta"].clone())
}

pub fn write_clear_request() -> String {
    encode(json!({"type": "clear_request"}))
}

pub fn write_clear_reply() -> String {
    encode(json!({"type": "clear_reply"}))
}

pub fn read_clear_reply(root: &Value) -> Result<()> {
    check_reply(root, "clear_reply")
}

pub fn write_debug_request(debug: &Value) -> String {
    encode(json!({"type": "debug_command", "debug": debug}))
}

pub fn write_debug_reply(result: &Value) -> String {
    encode(json!({"type": "debug_reply", "result": result}))
}

pub fn read_debug_reply(root: &Value) -> Result<Value> {
    check_reply(root, "debug_reply")?;
    Ok(root["result"].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Payload;

    fn parse(body: &str) -> Value {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_framing_roundtrip() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, "{\"type\":\"exit_request\"}").unwrap();
        let mut cursor = std::io::Cursor::new(buffer);
        let body = read_message(&mut cursor).unwrap();
        assert_eq!(body, "{\"type\":\"exit_request\"}");
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_MESSAGE_SIZE + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buffer);
        assert!(matches!(
            read_message(&mut cursor),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_register_roundtrip() {
        let body = write_register_request(StoreType::Plasma);
        let (version, store_type) = read_register_request(&parse(&body)).unwrap();
        assert_eq!(version, server_version());
        assert_eq!(store_type, StoreType::Plasma);

        let reply = RegisterReply {
            ipc_socket: "/tmp/arbor.sock".into(),
            rpc_endpoint: "0.0.0.0:9600".into(),
            instance_id: 3,
            session_id: 0,
            version: server_version().into(),
            store_match: true,
        };
        let body = write_register_reply(&reply);
        let decoded = read_register_reply(&parse(&body)).unwrap();
        assert_eq!(decoded.ipc_socket, reply.ipc_socket);
        assert_eq!(decoded.instance_id, 3);
        assert!(decoded.store_match);
    }

    #[test]
    fn test_store_type_accepts_legacy_numeric_encoding() {
        assert_eq!(StoreType::from_value(&json!(2)), StoreType::Plasma);
        assert_eq!(StoreType::from_value(&json!(1)), StoreType::Default);
        assert_eq!(StoreType::from_value(&json!("Plasma")), StoreType::Plasma);
        assert_eq!(StoreType::from_value(&json!(null)), StoreType::Default);
    }

    #[test]
    fn test_create_buffer_roundtrip() {
        let body = write_create_buffer_request(4096);
        assert_eq!(read_create_buffer_request(&parse(&body)).unwrap(), 4096);

        let payload = Payload::new(ObjectID::from_pointer(0x9000), 4096, 0x9000, 5, 1 << 20, 64);
        let body = write_create_buffer_reply(payload.object_id, &payload, 5);
        let (id, decoded, fd) = read_create_buffer_reply(&parse(&body)).unwrap();
        assert_eq!(id, payload.object_id);
        assert_eq!(decoded, payload);
        assert_eq!(fd, 5);
    }

    #[test]
    fn test_get_buffers_uses_indexed_keys() {
        let ids = vec![ObjectID(11), ObjectID(22), ObjectID(33)];
        let body = write_get_buffers_request(&ids, true);
        let root = parse(&body);
        assert_eq!(root["num"], 3);
        assert_eq!(root["0"], 11);
        assert_eq!(root["2"], 33);

        let (decoded, unsafe_get) = read_get_buffers_request(&root).unwrap();
        assert_eq!(decoded, ids);
        assert!(unsafe_get);
    }

    #[test]
    fn test_get_buffers_reply_roundtrip() {
        let payloads = vec![
            Payload::new(ObjectID::from_pointer(0x1000), 16, 0x1000, 4, 1 << 20, 0),
            Payload::new(ObjectID::from_pointer(0x2000), 32, 0x2000, 4, 1 << 20, 4096),
        ];
        let body = write_get_buffers_reply(&payloads, &[4]);
        let (decoded, fds) = read_get_buffers_reply(&parse(&body)).unwrap();
        assert_eq!(decoded, payloads);
        assert_eq!(fds, vec![4]);
    }

    #[test]
    fn test_error_envelope_surfaces_before_type_check() {
        let err = Error::ObjectNotSealed("o0000000000001234".into());
        let body = write_error_reply(&err);
        let result = read_get_buffers_reply(&parse(&body));
        assert!(matches!(result, Err(Error::ObjectNotSealed(_))));
    }

    #[test]
    fn test_move_ownership_roundtrip() {
        let request = MoveOwnership {
            id_to_id: vec![(ObjectID(1), ObjectID(1)), (ObjectID(2), ObjectID(9))],
            session_id: 42,
            ..MoveOwnership::default()
        };
        let body = write_move_buffers_ownership_request(&request);
        let decoded = read_move_buffers_ownership_request(&parse(&body)).unwrap();
        assert_eq!(decoded.id_to_id, request.id_to_id);
        assert!(decoded.pid_to_pid.is_empty());
        assert_eq!(decoded.session_id, 42);
    }

    #[test]
    fn test_command_taxonomy_is_closed() {
        assert_eq!(Command::parse("seal_request"), Command::Seal);
        assert_eq!(Command::parse("cluster_meta"), Command::ClusterMeta);
        assert_eq!(Command::parse("definitely_not_a_command"), Command::Null);
    }

    #[test]
    fn test_stream_messages_roundtrip() {
        let body = write_open_stream_request(ObjectID(77), 2);
        let (id, mode) = read_open_stream_request(&parse(&body)).unwrap();
        assert_eq!(id, ObjectID(77));
        assert_eq!(mode, 2);

        let body = write_pull_next_stream_chunk_reply(ObjectID(88));
        assert_eq!(
            read_pull_next_stream_chunk_reply(&parse(&body)).unwrap(),
            ObjectID(88)
        );
    }

    #[test]
    fn test_name_messages_roundtrip() {
        let body = write_get_name_request("training-set", true);
        let (name, wait) = read_get_name_request(&parse(&body)).unwrap();
        assert_eq!(name, "training-set");
        assert!(wait);
    }
}
