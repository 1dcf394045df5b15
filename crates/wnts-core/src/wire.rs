use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::SyncError;

/// Upper bound on a single wire frame (length prefix excluded).
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Wire frame layout: `u64 length (little-endian) || u8 tag || CBOR body`.
pub const LEN_PREFIX_BYTES: usize = 8;

/// The unspecified address doubles as the broadcast destination.
pub const BROADCAST: IpAddr = IpAddr::V6(Ipv6Addr::UNSPECIFIED);

/// Loopback destination: deliver to this node only.
pub const LOOPBACK: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);

/// Whether `ip` names "this node only" in routing. Exactly the two
/// loopback constants count; other `127.x.y.z` addresses stay routable so
/// several nodes can share one host.
pub fn is_self_addr(ip: IpAddr) -> bool {
    ip == IpAddr::V4(Ipv4Addr::LOCALHOST) || ip == IpAddr::V6(Ipv6Addr::LOCALHOST)
}

/// Message kind and its wire tag. `LinkLost` is synthesized locally and
/// never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Lock = 1,
    Unlock = 2,
    DeleteFile = 3,
    ContentChange = 4,
    InitialSync = 5,
    InitialSyncRequest = 6,
    Connect = 7,
    Disconnect = 8,
    Payload = 9,
    ResendRequest = 10,
    LinkLost = 11,
}

/// Routing header carried by every message. `sender` is the previous hop;
/// it is stamped on receive and never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(with = "wire_ip")]
    pub receiver: IpAddr,
    #[serde(with = "wire_ip")]
    pub originator: IpAddr,
    pub message_hash: u64,
    #[serde(skip, default = "unspecified")]
    pub sender: IpAddr,
}

fn unspecified() -> IpAddr {
    IpAddr::V6(Ipv6Addr::UNSPECIFIED)
}

impl Default for Header {
    fn default() -> Self {
        Self {
            receiver: BROADCAST,
            originator: unspecified(),
            message_hash: 0,
            sender: unspecified(),
        }
    }
}

/// Path and modification timestamp shared by the file-scoped messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    #[serde(with = "wire_path")]
    pub path: PathBuf,
    /// Seconds since the unix epoch.
    pub timestamp: i64,
}

/// One reconnectable mesh member: address plus service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    #[serde(with = "wire_ip")]
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Lock(FileMeta),
    Unlock(FileMeta),
    DeleteFile(FileMeta),
    ContentChange {
        file: FileMeta,
        content: Vec<u8>,
    },
    InitialSync {
        file: FileMeta,
        content: Vec<u8>,
        index: u64,
        total: u64,
    },
    InitialSyncRequest,
    Connect {
        backup_peers: Vec<PeerEntry>,
        managed_paths: Vec<PathBuf>,
    },
    Disconnect,
    Payload(Vec<u8>),
    ResendRequest {
        requested_hash: u64,
        original_destination: IpAddr,
    },
    LinkLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

// Per-variant wire structs. Field order is the wire order: header first,
// then the variant fields in declaration order.

#[derive(Serialize, Deserialize)]
struct FileFrame {
    header: Header,
    file: FileMeta,
}

#[derive(Serialize, Deserialize)]
struct ContentFrame {
    header: Header,
    file: FileMeta,
    #[serde(with = "serde_bytes")]
    content: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct InitialSyncFrame {
    header: Header,
    file: FileMeta,
    #[serde(with = "serde_bytes")]
    content: Vec<u8>,
    index: u64,
    total: u64,
}

#[derive(Serialize, Deserialize)]
struct BareFrame {
    header: Header,
}

#[derive(Serialize, Deserialize)]
struct ConnectFrame {
    header: Header,
    backup_peers: Vec<PeerEntry>,
    #[serde(with = "wire_paths")]
    managed_paths: Vec<PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct PayloadFrame {
    header: Header,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ResendFrame {
    header: Header,
    requested_hash: u64,
    #[serde(with = "wire_ip")]
    original_destination: IpAddr,
}

impl Message {
    pub fn new(body: Body) -> Self {
        Self {
            header: Header::default(),
            body,
        }
    }

    pub fn lock(path: PathBuf, timestamp: i64) -> Self {
        Self::new(Body::Lock(FileMeta { path, timestamp }))
    }

    pub fn unlock(path: PathBuf, timestamp: i64) -> Self {
        Self::new(Body::Unlock(FileMeta { path, timestamp }))
    }

    pub fn delete_file(path: PathBuf, timestamp: i64) -> Self {
        Self::new(Body::DeleteFile(FileMeta { path, timestamp }))
    }

    pub fn content_change(path: PathBuf, timestamp: i64, content: Vec<u8>) -> Self {
        Self::new(Body::ContentChange {
            file: FileMeta { path, timestamp },
            content,
        })
    }

    pub fn initial_sync(
        path: PathBuf,
        timestamp: i64,
        content: Vec<u8>,
        index: u64,
        total: u64,
    ) -> Self {
        Self::new(Body::InitialSync {
            file: FileMeta { path, timestamp },
            content,
            index,
            total,
        })
    }

    pub fn initial_sync_request() -> Self {
        Self::new(Body::InitialSyncRequest)
    }

    pub fn connect(backup_peers: Vec<PeerEntry>, managed_paths: Vec<PathBuf>) -> Self {
        Self::new(Body::Connect {
            backup_peers,
            managed_paths,
        })
    }

    pub fn disconnect() -> Self {
        Self::new(Body::Disconnect)
    }

    pub fn payload(payload: Vec<u8>) -> Self {
        Self::new(Body::Payload(payload))
    }

    pub fn resend_request(requested_hash: u64, original_destination: IpAddr) -> Self {
        Self::new(Body::ResendRequest {
            requested_hash,
            original_destination,
        })
    }

    /// Local notification that the link to `remote` is gone. Never hits
    /// the wire.
    pub fn link_lost(remote: IpAddr) -> Self {
        let mut msg = Self::new(Body::LinkLost);
        msg.header.originator = remote;
        msg.header.message_hash = msg.hash();
        msg
    }

    pub fn msg_type(&self) -> MsgType {
        match self.body {
            Body::Lock(_) => MsgType::Lock,
            Body::Unlock(_) => MsgType::Unlock,
            Body::DeleteFile(_) => MsgType::DeleteFile,
            Body::ContentChange { .. } => MsgType::ContentChange,
            Body::InitialSync { .. } => MsgType::InitialSync,
            Body::InitialSyncRequest => MsgType::InitialSyncRequest,
            Body::Connect { .. } => MsgType::Connect,
            Body::Disconnect => MsgType::Disconnect,
            Body::Payload(_) => MsgType::Payload,
            Body::ResendRequest { .. } => MsgType::ResendRequest,
            Body::LinkLost => MsgType::LinkLost,
        }
    }

    /// Queue priority; lower runs sooner.
    pub fn priority(&self) -> u8 {
        match self.body {
            Body::ResendRequest { .. } | Body::LinkLost => 0,
            Body::Connect { .. } | Body::InitialSyncRequest => 1,
            Body::Disconnect => 2,
            Body::Lock(_) | Body::Unlock(_) | Body::InitialSync { .. } => 4,
            Body::DeleteFile(_) | Body::ContentChange { .. } => 5,
            Body::Payload(_) => 10,
        }
    }

    /// Whether this message belongs to the file-scoped family (the family
    /// sharing the timestamp tie-break and the integrity-hash offset).
    pub fn is_file_family(&self) -> bool {
        matches!(
            self.body,
            Body::Lock(_)
                | Body::Unlock(_)
                | Body::DeleteFile(_)
                | Body::ContentChange { .. }
                | Body::InitialSync { .. }
        )
    }

    /// File timestamp for the priority tie-break, when in the file family.
    pub fn file_timestamp(&self) -> Option<i64> {
        match &self.body {
            Body::Lock(meta) | Body::Unlock(meta) | Body::DeleteFile(meta) => Some(meta.timestamp),
            Body::ContentChange { file, .. } | Body::InitialSync { file, .. } => {
                Some(file.timestamp)
            }
            _ => None,
        }
    }

    /// Canonical text form the integrity hash is computed over: type tag
    /// word, receiver, originator, then the typed fields.
    pub fn hash_string(&self) -> String {
        let mut s = String::new();
        let tag = match self.msg_type() {
            MsgType::Lock => "lock",
            MsgType::Unlock => "unlock",
            MsgType::DeleteFile => "delete",
            MsgType::ContentChange => "change",
            MsgType::InitialSync => "initialsync",
            MsgType::InitialSyncRequest => "syncrequest",
            MsgType::Connect => "connect",
            MsgType::Disconnect => "disconnect",
            MsgType::Payload => "payload",
            MsgType::ResendRequest => "resend",
            MsgType::LinkLost => "linklost",
        };
        let _ = write!(s, "{tag}{}{}", self.header.receiver, self.header.originator);
        match &self.body {
            Body::Lock(meta) | Body::Unlock(meta) | Body::DeleteFile(meta) => {
                let _ = write!(s, "{}{}", meta.path.display(), meta.timestamp);
            }
            Body::ContentChange { file, content } => {
                let _ = write!(s, "{}{}", file.path.display(), file.timestamp);
                s.push_str(&String::from_utf8_lossy(content));
            }
            Body::InitialSync {
                file,
                content,
                index,
                total,
            } => {
                let _ = write!(s, "{}{}", file.path.display(), file.timestamp);
                s.push_str(&String::from_utf8_lossy(content));
                let _ = write!(s, "{index}{total}");
            }
            Body::Connect {
                backup_peers,
                managed_paths,
            } => {
                for peer in backup_peers {
                    let _ = write!(s, "{}:{}", peer.ip, peer.port);
                }
                for path in managed_paths {
                    let _ = write!(s, "{}", path.display());
                }
            }
            Body::Payload(payload) => s.push_str(&String::from_utf8_lossy(payload)),
            Body::ResendRequest {
                requested_hash,
                original_destination,
            } => {
                let _ = write!(s, "{requested_hash}{original_destination}");
            }
            Body::InitialSyncRequest | Body::Disconnect | Body::LinkLost => {}
        }
        s
    }

    /// 64-bit integrity digest: the wrapping byte sum of `hash_string()`
    /// plus the per-class offset (1 for the file family, 0 otherwise).
    /// Deliberately weak and commutative; it catches corruption, not
    /// tampering. The offset is observable on the wire and kept for
    /// compatibility with the historical field ordering.
    pub fn hash(&self) -> u64 {
        let sum = self
            .hash_string()
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_add(u64::from(b)));
        sum.wrapping_add(if self.is_file_family() { 1 } else { 0 })
    }

    /// Stamp `message_hash` from the current field values.
    pub fn seal(&mut self) {
        self.header.message_hash = self.hash();
    }

    /// Encode into a frame body (`tag || CBOR`). The length prefix is
    /// written by the transport.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let header = self.header.clone();
        let mut out = vec![self.msg_type() as u8];
        let body = match &self.body {
            Body::Lock(meta) | Body::Unlock(meta) | Body::DeleteFile(meta) => {
                crate::cbor::to_vec(&FileFrame {
                    header,
                    file: meta.clone(),
                })?
            }
            Body::ContentChange { file, content } => crate::cbor::to_vec(&ContentFrame {
                header,
                file: file.clone(),
                content: content.clone(),
            })?,
            Body::InitialSync {
                file,
                content,
                index,
                total,
            } => crate::cbor::to_vec(&InitialSyncFrame {
                header,
                file: file.clone(),
                content: content.clone(),
                index: *index,
                total: *total,
            })?,
            Body::InitialSyncRequest | Body::Disconnect => {
                crate::cbor::to_vec(&BareFrame { header })?
            }
            Body::Connect {
                backup_peers,
                managed_paths,
            } => crate::cbor::to_vec(&ConnectFrame {
                header,
                backup_peers: backup_peers.clone(),
                managed_paths: managed_paths.clone(),
            })?,
            Body::Payload(payload) => crate::cbor::to_vec(&PayloadFrame {
                header,
                payload: payload.clone(),
            })?,
            Body::ResendRequest {
                requested_hash,
                original_destination,
            } => crate::cbor::to_vec(&ResendFrame {
                header,
                requested_hash: *requested_hash,
                original_destination: *original_destination,
            })?,
            Body::LinkLost => anyhow::bail!("link-lost messages are local and never serialize"),
        };
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a frame body produced by [`Message::encode`].
    pub fn decode(body: &[u8]) -> Result<Self, SyncError> {
        let (&tag, rest) = body
            .split_first()
            .ok_or(SyncError::UnknownMessageType(0))?;
        let corrupt = |err: ciborium::de::Error<std::io::Error>| {
            SyncError::Transport(crate::error::TransportError::Other(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )))
        };
        let msg = match tag {
            1 | 2 | 3 => {
                let frame: FileFrame = crate::cbor::from_slice(rest).map_err(corrupt)?;
                let body = match tag {
                    1 => Body::Lock(frame.file),
                    2 => Body::Unlock(frame.file),
                    _ => Body::DeleteFile(frame.file),
                };
                Self {
                    header: frame.header,
                    body,
                }
            }
            4 => {
                let frame: ContentFrame = crate::cbor::from_slice(rest).map_err(corrupt)?;
                Self {
                    header: frame.header,
                    body: Body::ContentChange {
                        file: frame.file,
                        content: frame.content,
                    },
                }
            }
            5 => {
                let frame: InitialSyncFrame = crate::cbor::from_slice(rest).map_err(corrupt)?;
                Self {
                    header: frame.header,
                    body: Body::InitialSync {
                        file: frame.file,
                        content: frame.content,
                        index: frame.index,
                        total: frame.total,
                    },
                }
            }
            6 | 8 => {
                let frame: BareFrame = crate::cbor::from_slice(rest).map_err(corrupt)?;
                let body = if tag == 6 {
                    Body::InitialSyncRequest
                } else {
                    Body::Disconnect
                };
                Self {
                    header: frame.header,
                    body,
                }
            }
            7 => {
                let frame: ConnectFrame = crate::cbor::from_slice(rest).map_err(corrupt)?;
                Self {
                    header: frame.header,
                    body: Body::Connect {
                        backup_peers: frame.backup_peers,
                        managed_paths: frame.managed_paths,
                    },
                }
            }
            9 => {
                let frame: PayloadFrame = crate::cbor::from_slice(rest).map_err(corrupt)?;
                Self {
                    header: frame.header,
                    body: Body::Payload(frame.payload),
                }
            }
            10 => {
                let frame: ResendFrame = crate::cbor::from_slice(rest).map_err(corrupt)?;
                Self {
                    header: frame.header,
                    body: Body::ResendRequest {
                        requested_hash: frame.requested_hash,
                        original_destination: frame.original_destination,
                    },
                }
            }
            other => return Err(SyncError::UnknownMessageType(other)),
        };
        Ok(msg)
    }
}

/// Write one length-prefixed frame: `u64` little-endian length followed by
/// the frame body.
pub async fn write_frame<S>(io: &mut S, body: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    io.write_u64_le(body.len() as u64).await?;
    io.write_all(body).await?;
    io.flush().await?;
    Ok(())
}

enum DecodeState {
    ReadingLength,
    ReadingBody(usize),
}

/// Incremental frame extractor for the per-peer read loop.
///
/// Bytes arrive in arbitrary slices; the decoder buffers until the full
/// 8-byte length or the full body is present, then yields the body and
/// shifts any surplus bytes to the front for the next frame. No bytes are
/// ever dropped on a state transition.
pub struct FrameDecoder {
    buf: Vec<u8>,
    state: DecodeState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: DecodeState::ReadingLength,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame body, or `None` when more bytes are
    /// needed. Errors on frames exceeding [`MAX_FRAME_BYTES`].
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, SyncError> {
        if let DecodeState::ReadingLength = self.state {
            if self.buf.len() < LEN_PREFIX_BYTES {
                return Ok(None);
            }
            let mut len_bytes = [0u8; LEN_PREFIX_BYTES];
            len_bytes.copy_from_slice(&self.buf[..LEN_PREFIX_BYTES]);
            let len = u64::from_le_bytes(len_bytes) as usize;
            if len > MAX_FRAME_BYTES {
                return Err(SyncError::Transport(
                    crate::error::TransportError::Other(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("frame length {len} exceeds limit"),
                    )),
                ));
            }
            self.buf.drain(..LEN_PREFIX_BYTES);
            self.state = DecodeState::ReadingBody(len);
        }
        if let DecodeState::ReadingBody(len) = self.state {
            if self.buf.len() < len {
                return Ok(None);
            }
            let frame = self.buf[..len].to_vec();
            self.buf.drain(..len);
            self.state = DecodeState::ReadingLength;
            return Ok(Some(frame));
        }
        Ok(None)
    }
}

mod wire_ip {
    //! IP addresses serialize as `family byte || address bytes in network
    //! order` (4 for IPv4, 6 for IPv6).

    use std::net::IpAddr;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ip: &IpAddr, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::Serialize;
        match ip {
            IpAddr::V4(v4) => {
                (4u8, serde_bytes::ByteBuf::from(v4.octets().to_vec())).serialize(serializer)
            }
            IpAddr::V6(v6) => {
                (6u8, serde_bytes::ByteBuf::from(v6.octets().to_vec())).serialize(serializer)
            }
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<IpAddr, D::Error> {
        let (family, bytes): (u8, serde_bytes::ByteBuf) = Deserialize::deserialize(deserializer)?;
        match family {
            4 => {
                let octets: [u8; 4] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| D::Error::custom("ipv4 address must be 4 bytes"))?;
                Ok(IpAddr::from(octets))
            }
            6 => {
                let octets: [u8; 16] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| D::Error::custom("ipv6 address must be 16 bytes"))?;
                Ok(IpAddr::from(octets))
            }
            other => Err(D::Error::custom(format!("unknown address family {other}"))),
        }
    }
}

mod wire_path {
    //! Paths serialize as a vector of UTF-8 path components.

    use std::path::PathBuf;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn components(path: &std::path::Path) -> Vec<String> {
        path.iter()
            .map(|c| c.to_string_lossy().into_owned())
            .collect()
    }

    pub fn join(components: Vec<String>) -> PathBuf {
        components.into_iter().collect()
    }

    pub fn serialize<S: Serializer>(
        path: &std::path::Path,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        use serde::Serialize;
        components(path).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        let parts: Vec<String> = Deserialize::deserialize(deserializer)?;
        Ok(join(parts))
    }
}

mod wire_paths {
    //! `Vec<PathBuf>` via the component encoding of [`super::wire_path`].

    use std::path::PathBuf;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(paths: &[PathBuf], serializer: S) -> Result<S::Ok, S::Error> {
        use serde::Serialize;
        paths
            .iter()
            .map(|p| super::wire_path::components(p))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<PathBuf>, D::Error> {
        let parts: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
        Ok(parts.into_iter().map(super::wire_path::join).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        let encoded = msg.encode().expect("encode message");
        Message::decode(&encoded).expect("decode message")
    }

    #[test]
    fn content_change_roundtrip() {
        let mut msg = Message::content_change(
            PathBuf::from("dir/hello.txt"),
            1_700_000_000,
            b"hi".to_vec(),
        );
        msg.header.receiver = "fd00::2".parse().expect("valid ip");
        msg.header.originator = "fd00::1".parse().expect("valid ip");
        msg.seal();

        let decoded = roundtrip(&msg);
        assert_eq!(decoded, msg);
        assert_eq!(decoded.hash(), decoded.header.message_hash);
    }

    #[test]
    fn connect_roundtrip_keeps_backups_and_paths() {
        let mut msg = Message::connect(
            vec![
                PeerEntry {
                    ip: "10.0.0.5".parse().expect("valid ip"),
                    port: 9419,
                },
                PeerEntry {
                    ip: "fd00::7".parse().expect("valid ip"),
                    port: 9420,
                },
            ],
            vec![PathBuf::from("docs"), PathBuf::from("src/nested")],
        );
        msg.header.originator = "10.0.0.1".parse().expect("valid ip");
        msg.seal();

        let decoded = roundtrip(&msg);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn resend_and_bare_roundtrips() {
        let mut resend = Message::resend_request(42, "10.1.0.2".parse().expect("valid ip"));
        resend.seal();
        assert_eq!(roundtrip(&resend), resend);

        let mut sync_req = Message::initial_sync_request();
        sync_req.header.originator = "10.1.0.9".parse().expect("valid ip");
        sync_req.seal();
        assert_eq!(roundtrip(&sync_req), sync_req);

        let mut disconnect = Message::disconnect();
        disconnect.header.originator = "10.1.0.9".parse().expect("valid ip");
        disconnect.seal();
        assert_eq!(roundtrip(&disconnect), disconnect);
    }

    #[test]
    fn sender_is_never_serialized() {
        let mut msg = Message::payload(b"ping".to_vec());
        msg.header.sender = "10.0.0.3".parse().expect("valid ip");
        msg.seal();

        let decoded = roundtrip(&msg);
        assert!(decoded.header.sender.is_unspecified());
    }

    #[test]
    fn link_lost_refuses_to_serialize() {
        let msg = Message::link_lost("10.0.0.3".parse().expect("valid ip"));
        assert!(msg.encode().is_err());
    }

    #[test]
    fn file_family_hash_carries_offset() {
        let lock = Message::lock(PathBuf::from("a"), 7);
        let sum: u64 = lock
            .hash_string()
            .bytes()
            .map(u64::from)
            .fold(0, u64::wrapping_add);
        assert_eq!(lock.hash(), sum + 1);

        let payload = Message::payload(b"a7".to_vec());
        let sum: u64 = payload
            .hash_string()
            .bytes()
            .map(u64::from)
            .fold(0, u64::wrapping_add);
        assert_eq!(payload.hash(), sum);
    }

    #[test]
    fn corrupted_content_changes_hash() {
        let mut msg = Message::content_change(PathBuf::from("f"), 1, b"abc".to_vec());
        msg.seal();
        let good = msg.hash();

        if let Body::ContentChange { content, .. } = &mut msg.body {
            content[0] ^= 0x01;
        }
        assert_ne!(msg.hash(), good);
        assert_eq!(msg.header.message_hash, good);
    }

    #[test]
    fn priorities_follow_the_table() {
        assert_eq!(Message::resend_request(1, LOOPBACK).priority(), 0);
        assert_eq!(Message::link_lost(LOOPBACK).priority(), 0);
        assert_eq!(Message::connect(vec![], vec![]).priority(), 1);
        assert_eq!(Message::disconnect().priority(), 2);
        assert_eq!(Message::lock(PathBuf::from("f"), 0).priority(), 4);
        assert_eq!(Message::unlock(PathBuf::from("f"), 0).priority(), 4);
        assert_eq!(
            Message::initial_sync(PathBuf::from("f"), 0, vec![], 0, 1).priority(),
            4
        );
        assert_eq!(Message::delete_file(PathBuf::from("f"), 0).priority(), 5);
        assert_eq!(Message::content_change(PathBuf::from("f"), 0, vec![]).priority(), 5);
        assert_eq!(Message::payload(vec![]).priority(), 10);
    }

    #[test]
    fn decoder_handles_split_and_joined_frames() {
        let mut a = Message::payload(b"first".to_vec());
        a.seal();
        let mut b = Message::payload(b"second".to_vec());
        b.seal();
        let body_a = a.encode().expect("encode");
        let body_b = b.encode().expect("encode");

        let mut stream = Vec::new();
        stream.extend_from_slice(&(body_a.len() as u64).to_le_bytes());
        stream.extend_from_slice(&body_a);
        stream.extend_from_slice(&(body_b.len() as u64).to_le_bytes());
        stream.extend_from_slice(&body_b);

        // Feed one byte at a time; both frames must come out intact.
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &stream {
            decoder.extend(std::slice::from_ref(byte));
            while let Some(frame) = decoder.next_frame().expect("decode") {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![body_a.clone(), body_b.clone()]);

        // Feed everything at once; surplus past the first frame is kept.
        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);
        assert_eq!(decoder.next_frame().expect("decode"), Some(body_a));
        assert_eq!(decoder.next_frame().expect("decode"), Some(body_b));
        assert_eq!(decoder.next_frame().expect("decode"), None);
    }

    #[test]
    fn decoder_rejects_oversized_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&(u64::MAX).to_le_bytes());
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn unknown_tag_is_a_typed_error() {
        let err = Message::decode(&[99, 0, 0]).expect_err("tag 99 is unknown");
        assert!(matches!(err, SyncError::UnknownMessageType(99)));
    }

    #[test]
    fn self_addressing_is_exact() {
        assert!(is_self_addr("127.0.0.1".parse().expect("valid ip")));
        assert!(is_self_addr("::1".parse().expect("valid ip")));
        assert!(!is_self_addr("127.0.0.2".parse().expect("valid ip")));
        assert!(!is_self_addr("10.0.0.1".parse().expect("valid ip")));
    }
}
