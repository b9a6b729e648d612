//! In-memory ZRFS servers for integration tests.
//!
//! [`MemoryServer`] implements [`Channel`] by decoding request frames and
//! applying them to a small in-memory tree, so the whole client stack runs
//! without a network. Hooks let tests script write replies, hold reads open
//! and observe the order of server-side events.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use zrfs_client::{Channel, FramedChannel, Session, TransportError};
use zrfs_proto::types::{PUBLIC_KEY_LEN, S_IFCHR, S_IFDIR, S_IFLNK, S_IFREG};
use zrfs_proto::{FrameReader, Opcode, ProtoError};

pub const EPERM: i64 = 1;
pub const ENOENT: i64 = 2;
pub const EBADF: i64 = 9;
pub const EBUSY: i64 = 16;
pub const EEXIST: i64 = 17;
pub const ENOTDIR: i64 = 20;
pub const EISDIR: i64 = 21;
pub const EINVAL: i64 = 22;
pub const EAGAIN: i64 = 35;
pub const ENOTEMPTY: i64 = 66;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A server-side reply override for the next `write` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePlan {
    /// Fail with this errno.
    Errno(i64),
    /// Accept at most this many bytes.
    Accept(usize),
}

#[derive(Debug, Clone)]
enum Kind {
    Dir,
    File(Vec<u8>),
    Symlink(String),
    /// Unsized device-like file: each read returns the next chunk.
    Virtual(VecDeque<Bytes>),
}

#[derive(Debug, Clone)]
struct Node {
    ino: u64,
    kind: Kind,
}

impl Node {
    fn mode_and_size(&self) -> (u64, u64) {
        match &self.kind {
            Kind::Dir => (S_IFDIR | 0o755, 0),
            Kind::File(data) => (S_IFREG | 0o644, data.len() as u64),
            Kind::Symlink(target) => (S_IFLNK | 0o777, target.len() as u64),
            Kind::Virtual(_) => (S_IFCHR | 0o444, 0),
        }
    }

    fn d_type(&self) -> u8 {
        match self.kind {
            Kind::Dir => 4,
            Kind::File(_) => 8,
            Kind::Symlink(_) => 10,
            Kind::Virtual(_) => 2,
        }
    }
}

struct OpenFile {
    path: String,
    append: bool,
}

#[derive(Default)]
struct Fs {
    nodes: BTreeMap<String, Node>,
    handles: HashMap<u64, OpenFile>,
    next_fh: u64,
    next_ino: u64,
    acl: HashMap<String, Vec<(String, u8)>>,
    write_plan: VecDeque<WritePlan>,
    max_write: Option<usize>,
    events: Vec<String>,
    requests: Vec<Opcode>,
}

pub fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

fn parent(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((dir, _)) => dir.to_string(),
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn bad(_: ProtoError) -> i64 {
    EINVAL
}

fn ok() -> BytesMut {
    let mut out = BytesMut::new();
    out.put_i64_le(0);
    out
}

fn status(code: i64) -> Bytes {
    let mut out = BytesMut::new();
    out.put_i64_le(code);
    out.freeze()
}

fn put_stat(out: &mut BytesMut, node: &Node) {
    let (mode, size) = node.mode_and_size();
    out.put_u64_le(1); // dev
    out.put_u64_le(node.ino);
    out.put_u64_le(size);
    out.put_u64_le(4096);
    out.put_u64_le(size.div_ceil(512));
    out.put_u64_le(mode);
}

fn read_path(r: &mut FrameReader<'_>) -> Result<String, i64> {
    let raw = r.cstr().map_err(bad)?;
    Ok(normalize(&String::from_utf8_lossy(raw)))
}

impl Fs {
    fn new() -> Self {
        let mut fs = Fs {
            next_fh: 3,
            next_ino: 1,
            ..Default::default()
        };
        fs.insert("/".to_string(), Kind::Dir);
        fs
    }

    fn insert(&mut self, path: String, kind: Kind) {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(path, Node { ino, kind });
    }

    fn node(&self, path: &str) -> Result<&Node, i64> {
        self.nodes.get(path).ok_or(ENOENT)
    }

    fn require_dir(&self, path: &str) -> Result<(), i64> {
        match self.node(path)?.kind {
            Kind::Dir => Ok(()),
            _ => Err(ENOTDIR),
        }
    }

    fn children(&self, dir: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|p| p.as_str() != "/" && parent(p) == dir)
            .cloned()
            .collect()
    }

    fn handle_path(&self, fh: u64) -> Result<String, i64> {
        self.handles
            .get(&fh)
            .map(|f| f.path.clone())
            .ok_or(EBADF)
    }

    fn open_handle(&mut self, path: String, append: bool) -> Bytes {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.events.push(format!("open fh={fh}"));
        self.handles.insert(fh, OpenFile { path, append });
        let mut out = ok();
        out.put_u64_le(fh);
        out.freeze()
    }

    fn handle(&mut self, frame: &[u8]) -> Bytes {
        match self.dispatch(frame) {
            Ok(reply) => reply,
            Err(code) => status(code),
        }
    }

    fn dispatch(&mut self, frame: &[u8]) -> Result<Bytes, i64> {
        let mut r = FrameReader::request(frame).map_err(bad)?;
        match r.opcode() {
            Opcode::Getattr => {
                let fh = r.u64().map_err(bad)?;
                let path = read_path(&mut r)?;
                let path = if fh != 0 { self.handle_path(fh)? } else { path };
                let mut out = ok();
                put_stat(&mut out, self.node(&path)?);
                Ok(out.freeze())
            }
            Opcode::Access => {
                let path = read_path(&mut r)?;
                self.node(&path)?;
                Ok(ok().freeze())
            }
            Opcode::Readdir => {
                let path = read_path(&mut r)?;
                self.require_dir(&path)?;
                let mut out = ok();
                let this = self.node(&path)?.clone();
                let up = self.node(&parent(&path))?.clone();
                for (name, node) in [(".", &this), ("..", &up)] {
                    put_dirent(&mut out, name, node);
                }
                for child in self.children(&path) {
                    put_dirent(&mut out, base_name(&child), self.node(&child)?);
                }
                Ok(out.freeze())
            }
            Opcode::Mkdir => {
                let path = read_path(&mut r)?;
                if self.nodes.contains_key(&path) {
                    return Err(EEXIST);
                }
                self.require_dir(&parent(&path))?;
                self.events.push(format!("mkdir {path}"));
                self.insert(path, Kind::Dir);
                Ok(ok().freeze())
            }
            Opcode::Unlink => {
                let path = read_path(&mut r)?;
                if let Kind::Dir = self.node(&path)?.kind {
                    return Err(EISDIR);
                }
                self.events.push(format!("unlink {path}"));
                self.nodes.remove(&path);
                Ok(ok().freeze())
            }
            Opcode::Rmdir => {
                let path = read_path(&mut r)?;
                if path == "/" {
                    return Err(EBUSY);
                }
                self.require_dir(&path)?;
                if !self.children(&path).is_empty() {
                    return Err(ENOTEMPTY);
                }
                self.events.push(format!("rmdir {path}"));
                self.nodes.remove(&path);
                Ok(ok().freeze())
            }
            Opcode::Symlink => {
                let target = String::from_utf8_lossy(r.cstr().map_err(bad)?).into_owned();
                let path = read_path(&mut r)?;
                if self.nodes.contains_key(&path) {
                    return Err(EEXIST);
                }
                self.require_dir(&parent(&path))?;
                self.insert(path, Kind::Symlink(target));
                Ok(ok().freeze())
            }
            Opcode::Rename => {
                let from = read_path(&mut r)?;
                let to = read_path(&mut r)?;
                self.node(&from)?;
                self.require_dir(&parent(&to))?;
                let prefix = format!("{from}/");
                let moved: Vec<String> = self
                    .nodes
                    .keys()
                    .filter(|p| **p == from || p.starts_with(&prefix))
                    .cloned()
                    .collect();
                for old in moved {
                    if let Some(node) = self.nodes.remove(&old) {
                        let new = format!("{to}{}", &old[from.len()..]);
                        self.nodes.insert(new, node);
                    }
                }
                Ok(ok().freeze())
            }
            Opcode::Link => {
                let existing = read_path(&mut r)?;
                let new = read_path(&mut r)?;
                let Kind::File(data) = self.node(&existing)?.kind.clone() else {
                    return Err(EPERM);
                };
                if self.nodes.contains_key(&new) {
                    return Err(EEXIST);
                }
                self.insert(new, Kind::File(data));
                Ok(ok().freeze())
            }
            Opcode::Create => {
                let flags = r.i64().map_err(bad)?;
                let path = read_path(&mut r)?;
                self.require_dir(&parent(&path))?;
                self.insert(path.clone(), Kind::File(Vec::new()));
                Ok(self.open_handle(path, flags & i64::from(libc::O_APPEND) != 0))
            }
            Opcode::Open => {
                let flags = r.i64().map_err(bad)?;
                let path = read_path(&mut r)?;
                let has = |bit: libc::c_int| flags & i64::from(bit) != 0;
                match self.nodes.get_mut(&path) {
                    Some(_) if has(libc::O_CREAT) && has(libc::O_EXCL) => return Err(EEXIST),
                    Some(node) => {
                        if let (true, Kind::File(data)) = (has(libc::O_TRUNC), &mut node.kind) {
                            data.clear();
                        }
                    }
                    None if has(libc::O_CREAT) => {
                        self.require_dir(&parent(&path))?;
                        self.insert(path.clone(), Kind::File(Vec::new()));
                    }
                    None => return Err(ENOENT),
                }
                Ok(self.open_handle(path, has(libc::O_APPEND)))
            }
            Opcode::Read => {
                let fh = r.u64().map_err(bad)?;
                let size = r.u64().map_err(bad)? as usize;
                let offset = r.u64().map_err(bad)? as usize;
                let path = self.handle_path(fh)?;
                let node = self.nodes.get_mut(&path).ok_or(ENOENT)?;
                let mut out = ok();
                match &mut node.kind {
                    Kind::File(data) => {
                        let start = offset.min(data.len());
                        let end = offset.saturating_add(size).min(data.len());
                        out.put_slice(&data[start..end]);
                    }
                    Kind::Virtual(chunks) => {
                        if let Some(chunk) = chunks.pop_front() {
                            out.put_slice(&chunk);
                        }
                    }
                    Kind::Dir => return Err(EISDIR),
                    Kind::Symlink(_) => return Err(EINVAL),
                }
                Ok(out.freeze())
            }
            Opcode::Write => {
                let fh = r.u64().map_err(bad)?;
                let size = r.u64().map_err(bad)? as usize;
                let offset = r.u64().map_err(bad)? as usize;
                let payload = r.rest();
                let mut take = size.min(payload.len());
                match self.write_plan.pop_front() {
                    Some(WritePlan::Errno(code)) => {
                        self.events.push(format!("write fh={fh} errno={code}"));
                        return Ok(status(-code));
                    }
                    Some(WritePlan::Accept(n)) => take = take.min(n),
                    None => {}
                }
                if let Some(max) = self.max_write {
                    take = take.min(max);
                }
                let Some(open) = self.handles.get(&fh) else {
                    return Ok(status(-EBADF));
                };
                let append = open.append;
                let path = open.path.clone();
                let Some(Node {
                    kind: Kind::File(data),
                    ..
                }) = self.nodes.get_mut(&path)
                else {
                    return Ok(status(-EISDIR));
                };
                let at = if append { data.len() } else { offset };
                if data.len() < at + take {
                    data.resize(at + take, 0);
                }
                data[at..at + take].copy_from_slice(&payload[..take]);
                self.events.push(format!("write fh={fh} at={at} len={take}"));
                Ok(status(take as i64))
            }
            Opcode::Statfs => {
                let path = read_path(&mut r)?;
                self.node(&path)?;
                let mut out = ok();
                for v in [4096, 4096, 1000, 500, 400, 100, 50, 40, 7, 0, 255] {
                    out.put_u64_le(v);
                }
                Ok(out.freeze())
            }
            Opcode::Release => {
                let fh = r.u64().map_err(bad)?;
                self.handles.remove(&fh).ok_or(EBADF)?;
                self.events.push(format!("release fh={fh}"));
                Ok(ok().freeze())
            }
            Opcode::Getperm => {
                let path = read_path(&mut r)?;
                self.node(&path)?;
                let mut out = ok();
                for (key, perm) in self.acl.get(&path).into_iter().flatten() {
                    out.put_slice(key.as_bytes());
                    out.put_u8(*perm);
                }
                Ok(out.freeze())
            }
            Opcode::Setperm => {
                let perm = r.u64().map_err(bad)? as u8;
                let key = String::from_utf8_lossy(r.bytes(PUBLIC_KEY_LEN).map_err(bad)?).into_owned();
                let path = read_path(&mut r)?;
                self.node(&path)?;
                let acl = self.acl.entry(path).or_default();
                acl.retain(|(k, _)| *k != key);
                acl.push((key, perm));
                Ok(ok().freeze())
            }
            Opcode::Truncate => {
                let fh = r.u64().map_err(bad)?;
                let length = r.u64().map_err(bad)? as usize;
                let path = read_path(&mut r)?;
                let path = if fh != 0 { self.handle_path(fh)? } else { path };
                match &mut self.nodes.get_mut(&path).ok_or(ENOENT)?.kind {
                    Kind::File(data) => data.resize(length, 0),
                    Kind::Dir => return Err(EISDIR),
                    _ => return Err(EINVAL),
                }
                Ok(ok().freeze())
            }
        }
    }
}

fn put_dirent(out: &mut BytesMut, name: &str, node: &Node) {
    out.put_u8(node.d_type());
    put_stat(out, node);
    out.put_slice(name.as_bytes());
    out.put_u8(0);
}

/// In-memory filesystem server.
pub struct MemoryServer {
    fs: Mutex<Fs>,
    read_gate: Mutex<Option<Arc<Semaphore>>>,
    reads_in_flight: AtomicUsize,
    max_reads_in_flight: AtomicUsize,
    disconnected: AtomicBool,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fs: Mutex::new(Fs::new()),
            read_gate: Mutex::new(None),
            reads_in_flight: AtomicUsize::new(0),
            max_reads_in_flight: AtomicUsize::new(0),
            disconnected: AtomicBool::new(false),
        })
    }

    /// A session talking to this server.
    pub fn session(self: &Arc<Self>) -> Session {
        Session::with_channel(self.clone())
    }

    /// A session whose requests cross a length-delimited byte stream, as
    /// they do over SSH.
    pub fn framed_session(self: &Arc<Self>) -> Session {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(server, self.clone()));
        Session::with_channel(Arc::new(FramedChannel::new(client)))
    }

    pub fn add_dir(&self, path: &str) {
        self.fs.lock().insert(normalize(path), Kind::Dir);
    }

    pub fn add_file(&self, path: &str, contents: impl AsRef<[u8]>) {
        self.fs
            .lock()
            .insert(normalize(path), Kind::File(contents.as_ref().to_vec()));
    }

    /// A size-0 character device that yields `chunks` one per read.
    pub fn add_virtual(&self, path: &str, chunks: &[&[u8]]) {
        let chunks = chunks.iter().map(|c| Bytes::copy_from_slice(c)).collect();
        self.fs.lock().insert(normalize(path), Kind::Virtual(chunks));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match &self.fs.lock().nodes.get(&normalize(path))?.kind {
            Kind::File(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.fs.lock().nodes.contains_key(&normalize(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(
            self.fs.lock().nodes.get(&normalize(path)).map(|n| &n.kind),
            Some(Kind::Dir)
        )
    }

    pub fn open_handles(&self) -> usize {
        self.fs.lock().handles.len()
    }

    pub fn events(&self) -> Vec<String> {
        self.fs.lock().events.clone()
    }

    /// Number of requests received with opcode `op`.
    pub fn count(&self, op: Opcode) -> usize {
        self.fs.lock().requests.iter().filter(|o| **o == op).count()
    }

    pub fn plan_writes(&self, plan: impl IntoIterator<Item = WritePlan>) {
        self.fs.lock().write_plan.extend(plan);
    }

    /// Cap every write at `max` bytes.
    pub fn set_max_write(&self, max: usize) {
        self.fs.lock().max_write = Some(max);
    }

    /// Make reads wait for a permit; each permit added releases one read.
    pub fn hold_reads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.read_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn reads_in_flight(&self) -> usize {
        self.reads_in_flight.load(Ordering::SeqCst)
    }

    pub fn max_reads_in_flight(&self) -> usize {
        self.max_reads_in_flight.load(Ordering::SeqCst)
    }

    async fn read(&self, frame: &[u8]) -> Bytes {
        let gate = self.read_gate.lock().clone();
        let now = self.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_reads_in_flight.fetch_max(now, Ordering::SeqCst);
        self.fs.lock().events.push("read-start".to_string());

        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        tokio::task::yield_now().await;

        let reply = self.fs.lock().handle(frame);
        self.fs.lock().events.push("read-end".to_string());
        self.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

#[async_trait]
impl Channel for MemoryServer {
    async fn request(&self, frame: Bytes) -> Result<Bytes, TransportError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let op = Opcode::of(&frame)
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
        self.fs.lock().requests.push(op);
        if op == Opcode::Read {
            return Ok(self.read(&frame).await);
        }
        Ok(self.fs.lock().handle(&frame))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Replies from a fixed script; records every request frame.
pub struct ScriptedChannel {
    replies: Mutex<VecDeque<Bytes>>,
    requests: Mutex<Vec<Bytes>>,
}

impl ScriptedChannel {
    pub fn new(replies: impl IntoIterator<Item = Bytes>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn session(self: &Arc<Self>) -> Session {
        Session::with_channel(self.clone())
    }

    pub fn requests(&self) -> Vec<Bytes> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn request(&self, frame: Bytes) -> Result<Bytes, TransportError> {
        self.requests.lock().push(frame);
        self.replies.lock().pop_front().ok_or(TransportError::Closed)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Build a reply frame: status word followed by `payload`.
pub fn reply(code: i64, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_i64_le(code);
    out.put_slice(payload);
    out.freeze()
}

/// Answer tagged frames from `stream` with `fs` until the client hangs up.
pub async fn serve<S>(stream: S, fs: Arc<MemoryServer>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let codec = LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .max_frame_length(u32::MAX as usize)
        .new_codec();
    let mut framed = Framed::new(stream, codec);

    while let Some(Ok(mut message)) = framed.next().await {
        let tag = message.get_u64_le();
        let Ok(reply) = fs.request(message.freeze()).await else {
            break;
        };
        let mut out = BytesMut::with_capacity(8 + reply.len());
        out.put_u64_le(tag);
        out.put_slice(&reply);
        if framed.send(out.freeze()).await.is_err() {
            break;
        }
    }
}
