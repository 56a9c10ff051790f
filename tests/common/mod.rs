//! In-process mock of the store, serving the control protocol over a Unix
//! socket in a temporary directory and backing every buffer with one
//! anonymous arena file.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use serde_json::{json, Value};
use shm_store_client::mmap::HEADER_RESERVATION;
use shm_store_client::protocol::{read_message, write_message, Payload, DEFAULT_MAX_MESSAGE_SIZE};
use shm_store_client::{ObjectId, StatusCode};
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

/// Bytes in the single arena, header included.
pub const ARENA_SIZE: usize = 1 << 16;

/// The mock's own descriptor number for its arena.
pub const STORE_FD: i32 = 42;

pub const INSTANCE_ID: u64 = 7;

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub version: String,
    /// Fail registration with this status code.
    pub register_code: Option<StatusCode>,
    /// Allocate this many extra bytes on every create.
    pub size_skew: usize,
    /// Never answer requests of this type.
    pub stall: Option<&'static str>,
    /// Answer requests of this type with a reply of some other type.
    pub wrong_reply: Option<&'static str>,
    /// Send the descriptor byte without the descriptor.
    pub withhold_fd: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            register_code: None,
            size_skew: 0,
            stall: None,
            wrong_reply: None,
            withhold_fd: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    pub connections: AtomicUsize,
    pub requests: AtomicUsize,
    pub fds_sent: AtomicUsize,
    pub exits: AtomicUsize,
}

impl Stats {
    pub fn fds_sent(&self) -> usize {
        self.fds_sent.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn exits(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }
}

struct Shared {
    arena: File,
    options: MockOptions,
    stats: Arc<Stats>,
    next_offset: Mutex<usize>,
    next_id: AtomicU64,
    objects: Mutex<HashMap<ObjectId, (usize, usize)>>,
    names: Mutex<HashMap<String, ObjectId>>,
}

pub struct MockStore {
    pub path: PathBuf,
    pub stats: Arc<Stats>,
    task: JoinHandle<()>,
    _dir: TempDir,
}

impl MockStore {
    pub async fn start() -> Self {
        Self::start_with(MockOptions::default()).await
    }

    pub async fn start_with(options: MockOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let arena = tempfile::tempfile().unwrap();
        arena.set_len(ARENA_SIZE as u64).unwrap();

        let stats = Arc::new(Stats::default());
        let shared = Arc::new(Shared {
            arena,
            options,
            stats: stats.clone(),
            next_offset: Mutex::new(HEADER_RESERVATION),
            next_id: AtomicU64::new(1),
            objects: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
        });

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.stats.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, shared.clone()));
            }
        });

        Self {
            path,
            stats,
            task,
            _dir: dir,
        }
    }

    /// Poll until `cond` holds or a second passes.
    pub async fn wait_for(&self, cond: impl Fn(&Stats) -> bool) -> bool {
        for _ in 0..100 {
            if cond(&self.stats) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl Drop for MockStore {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn payload(id: ObjectId, offset: usize, size: usize) -> Payload {
    let empty = size == 0;
    Payload {
        object_id: id,
        store_fd: if empty { -1 } else { STORE_FD },
        data_offset: offset,
        data_size: size,
        map_size: if empty {
            0
        } else {
            ARENA_SIZE - HEADER_RESERVATION
        },
        owning: false,
        sealed: true,
        gpu: false,
    }
}

fn error_reply(kind: &str, code: StatusCode, message: &str) -> Value {
    json!({ "type": kind, "code": code.code(), "message": message })
}

async fn serve(mut stream: UnixStream, shared: Arc<Shared>) {
    let mut fd_sent = false;

    loop {
        let Ok(message) = read_message(&mut stream, DEFAULT_MAX_MESSAGE_SIZE).await else {
            return;
        };
        shared.stats.requests.fetch_add(1, Ordering::SeqCst);
        let request: Value = serde_json::from_slice(&message).unwrap();
        let kind = request["type"].as_str().unwrap_or_default().to_string();

        if shared.options.stall == Some(kind.as_str()) {
            // keep the connection open, never answer
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return;
        }

        let mut needs_fd = false;
        let reply = match kind.as_str() {
            "register_request" => match shared.options.register_code {
                Some(code) => error_reply("register_reply", code, "registration refused"),
                None => json!({
                    "type": "register_reply",
                    "ipc_socket": "/tmp/mock-store.sock",
                    "rpc_endpoint": "127.0.0.1:9600",
                    "instance_id": INSTANCE_ID,
                    "version": shared.options.version,
                }),
            },
            "create_buffer_request" => {
                let size = request["size"].as_u64().unwrap() as usize + shared.options.size_skew;
                let offset = {
                    let mut next = shared.next_offset.lock().unwrap();
                    let offset = *next;
                    *next += size;
                    offset
                };
                if offset + size > ARENA_SIZE {
                    error_reply("create_buffer_reply", StatusCode::NotEnoughMemory, "arena full")
                } else {
                    let raw = shared.next_id.fetch_add(1, Ordering::SeqCst);
                    let id = ObjectId::new(ObjectId::EMPTY_BLOB.as_u64() | raw);
                    shared.objects.lock().unwrap().insert(id, (offset, size));
                    needs_fd = true;
                    json!({
                        "type": "create_buffer_reply",
                        "id": id,
                        "created": payload(id, offset, size),
                    })
                }
            }
            "get_buffers_request" => {
                let ids: Vec<ObjectId> = serde_json::from_value(request["id"].clone()).unwrap();
                let objects = shared.objects.lock().unwrap();
                let mut payloads = Vec::new();
                for id in ids {
                    if id == ObjectId::EMPTY_BLOB {
                        payloads.push(payload(id, 0, 0));
                    } else if let Some(&(offset, size)) = objects.get(&id) {
                        needs_fd |= size > 0;
                        payloads.push(payload(id, offset, size));
                    }
                }
                json!({ "type": "get_buffers_reply", "payloads": payloads })
            }
            "put_name_request" => {
                let id: ObjectId = serde_json::from_value(request["object_id"].clone()).unwrap();
                let name = request["name"].as_str().unwrap().to_string();
                shared.names.lock().unwrap().insert(name, id);
                json!({ "type": "put_name_reply" })
            }
            "get_name_request" => {
                let name = request["name"].as_str().unwrap();
                let wait = request["wait"].as_bool().unwrap_or(false);
                let mut found = shared.names.lock().unwrap().get(name).copied();
                while found.is_none() && wait {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    found = shared.names.lock().unwrap().get(name).copied();
                }
                match found {
                    Some(id) => json!({ "type": "get_name_reply", "object_id": id }),
                    None => error_reply(
                        "get_name_reply",
                        StatusCode::ObjectNotExists,
                        "name not found",
                    ),
                }
            }
            "drop_name_request" => {
                let name = request["name"].as_str().unwrap();
                let removed = shared.names.lock().unwrap().remove(name);
                match removed {
                    Some(_) => json!({ "type": "drop_name_reply" }),
                    None => error_reply(
                        "drop_name_reply",
                        StatusCode::ObjectNotExists,
                        "name not found",
                    ),
                }
            }
            "exit_request" => {
                shared.stats.exits.fetch_add(1, Ordering::SeqCst);
                return;
            }
            other => panic!("mock store got unexpected request {other}"),
        };

        let reply = if shared.options.wrong_reply == Some(kind.as_str()) {
            needs_fd = false;
            json!({ "type": "exit_reply" })
        } else {
            reply
        };

        let body = serde_json::to_vec(&reply).unwrap();
        if write_message(&mut stream, &body).await.is_err() {
            return;
        }

        if needs_fd && !fd_sent && shared.options.withhold_fd {
            if stream.write_all(&[0]).await.is_err() {
                return;
            }
        } else if needs_fd && !fd_sent {
            send_fd(&stream, shared.arena.as_raw_fd()).await.unwrap();
            shared.stats.fds_sent.fetch_add(1, Ordering::SeqCst);
            fd_sent = true;
        }
    }
}

/// One data byte with `fd` attached as `SCM_RIGHTS`.
async fn send_fd(stream: &UnixStream, fd: RawFd) -> io::Result<()> {
    let socket = stream.as_raw_fd();
    stream
        .async_io(Interest::WRITABLE, || {
            let byte = [0u8];
            let iov = [IoSlice::new(&byte)];
            let fds = [fd];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            sendmsg::<UnixAddr>(socket, &iov, &cmsgs, MsgFlags::empty(), None)
                .map(|_| ())
                .map_err(io::Error::from)
        })
        .await
}
