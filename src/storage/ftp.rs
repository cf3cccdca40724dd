//! FTP backend.
//!
//! A small passive-mode client over tokio TCP.  Every adapter call opens
//! its own control connection, so calls never share transfer state.  The
//! data connection always targets the control host: the address advertised
//! in the `227` reply is frequently a private one behind NAT.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use super::config::FtpConfig;
use super::listing::fold_listing;
use super::signing::{ProxyOp, ProxySigner};
use super::{
    prefix_dir, split_parent, validate_key, GetOptions, ListOptions, ListResult, PutOptions,
    StorageAdapter, StorageKind, StorageObject,
};
use crate::error::{StorageError, StorageResult};

const BACKEND: &str = "ftp";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    fn is(&self, codes: &[u16]) -> bool {
        codes.contains(&self.code)
    }
}

/// Read one (possibly multi-line) reply: `123-first` ... `123 last`.
pub(crate) async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Reply> {
    let mut first = String::new();
    if reader.read_line(&mut first).await? == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "control connection closed",
        ));
    }
    let first = first.trim_end().to_string();
    let code: u16 = first
        .get(..3)
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| std::io::Error::other(format!("malformed FTP reply: {first}")))?;

    let mut text = first.get(4..).unwrap_or_default().to_string();
    if first.as_bytes().get(3) == Some(&b'-') {
        let terminator = format!("{code} ");
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            let line = line.trim_end();
            if let Some(rest) = line.strip_prefix(&terminator) {
                text.push('\n');
                text.push_str(rest);
                break;
            }
            text.push('\n');
            text.push_str(line);
        }
    }
    Ok(Reply { code, text })
}

/// Port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
pub(crate) fn parse_pasv(text: &str) -> Option<u16> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    let nums: Vec<u16> = text[start + 1..end]
        .split(',')
        .map(|n| n.trim().parse().ok())
        .collect::<Option<_>>()?;
    match nums.as_slice() {
        [_, _, _, _, p1, p2] if *p1 < 256 && *p2 < 256 => Some(p1 * 256 + p2),
        _ => None,
    }
}

/// `YYYYMMDDHHMMSS[.sss]` timestamps used by MDTM and MLSD.
pub(crate) fn parse_ftp_time(raw: &str) -> Option<DateTime<Utc>> {
    let digits = raw.get(..14)?;
    NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S")
        .ok()
        .map(|t| t.and_utc())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// One `MLSD` line: `type=file;size=12;modify=20240101000000; name`.
pub(crate) fn parse_mlsd_line(line: &str) -> Option<DirEntry> {
    let (facts, name) = line.split_once(' ')?;
    let mut entry = DirEntry {
        name: name.to_string(),
        is_dir: false,
        size: 0,
        modified: None,
    };
    let mut kind = None;
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let (k, v) = fact.split_once('=')?;
        match k.to_ascii_lowercase().as_str() {
            "type" => kind = Some(v.to_ascii_lowercase()),
            "size" => entry.size = v.parse().unwrap_or(0),
            "modify" => entry.modified = parse_ftp_time(v),
            _ => {}
        }
    }
    match kind.as_deref() {
        Some("file") => Some(entry),
        Some("dir") => {
            entry.is_dir = true;
            Some(entry)
        }
        _ => None,
    }
}

/// One Unix-style `LIST` line, used when the server has no MLSD.
pub(crate) fn parse_list_line(line: &str) -> Option<DirEntry> {
    let mut fields = line.split_whitespace();
    let perms = fields.next()?;
    let size = fields.nth(3)?.parse().unwrap_or(0);
    // month, day, time/year
    let name: Vec<&str> = fields.skip(3).collect();
    if name.is_empty() {
        return None;
    }
    let name = name.join(" ");
    if name == "." || name == ".." {
        return None;
    }
    Some(DirEntry {
        name,
        is_dir: perms.starts_with('d'),
        size,
        modified: None,
    })
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    host: String,
}

fn io_error(err: std::io::Error) -> StorageError {
    StorageError::transient(BACKEND, err)
}

/// Map a negative reply.  `530` is a login failure and `550` means the file
/// is unavailable.
fn reply_error(key: &str, cmd: &str, reply: &Reply) -> StorageError {
    match reply.code {
        530 => StorageError::auth(BACKEND, reply.text.clone()),
        550 => StorageError::not_found(key),
        _ => StorageError::transient(
            BACKEND,
            format!("{cmd} failed ({}): {}", reply.code, reply.text),
        ),
    }
}

impl Session {
    async fn open(config: &FtpConfig) -> StorageResult<Self> {
        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| StorageError::transient(BACKEND, format!("connect to {} timed out", config.host)))?
        .map_err(io_error)?;
        let (read, writer) = stream.into_split();
        let mut session = Self {
            reader: BufReader::new(read),
            writer,
            host: config.host.clone(),
        };

        let greeting = read_reply(&mut session.reader).await.map_err(io_error)?;
        if greeting.code != 220 {
            return Err(reply_error("", "connect", &greeting));
        }
        let user = session.cmd(&format!("USER {}", config.username)).await?;
        match user.code {
            230 => {}
            331 | 332 => {
                let pass = session.cmd(&format!("PASS {}", config.password)).await?;
                if !pass.is(&[230, 202]) {
                    return Err(StorageError::auth(BACKEND, pass.text));
                }
            }
            _ => return Err(StorageError::auth(BACKEND, user.text)),
        }
        session.expect("", "TYPE I", &[200]).await?;
        Ok(session)
    }

    async fn cmd(&mut self, line: &str) -> StorageResult<Reply> {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(io_error)?;
        read_reply(&mut self.reader).await.map_err(io_error)
    }

    async fn expect(&mut self, key: &str, line: &str, ok: &[u16]) -> StorageResult<Reply> {
        let reply = self.cmd(line).await?;
        if reply.is(ok) {
            Ok(reply)
        } else {
            let verb = line.split(' ').next().unwrap_or(line);
            Err(reply_error(key, verb, &reply))
        }
    }

    async fn passive(&mut self) -> StorageResult<TcpStream> {
        let reply = self.expect("", "PASV", &[227]).await?;
        let port = parse_pasv(&reply.text).ok_or_else(|| {
            StorageError::transient(BACKEND, format!("unparseable PASV reply: {}", reply.text))
        })?;
        TcpStream::connect((self.host.as_str(), port))
            .await
            .map_err(io_error)
    }

    /// Run a transfer command and wait for the `226` completion reply.
    async fn finish_transfer(&mut self, key: &str) -> StorageResult<()> {
        let done = read_reply(&mut self.reader).await.map_err(io_error)?;
        if done.is(&[226, 250]) {
            Ok(())
        } else {
            Err(reply_error(key, "transfer", &done))
        }
    }

    async fn retrieve(&mut self, key: &str, path: &str) -> StorageResult<Vec<u8>> {
        let mut data = self.passive().await?;
        self.expect(key, &format!("RETR {path}"), &[125, 150]).await?;
        let mut buf = Vec::new();
        data.read_to_end(&mut buf).await.map_err(io_error)?;
        drop(data);
        self.finish_transfer(key).await?;
        Ok(buf)
    }

    async fn store(&mut self, key: &str, path: &str, payload: &[u8]) -> StorageResult<()> {
        let mut data = self.passive().await?;
        self.expect(key, &format!("STOR {path}"), &[125, 150]).await?;
        data.write_all(payload).await.map_err(io_error)?;
        data.shutdown().await.map_err(io_error)?;
        drop(data);
        self.finish_transfer(key).await
    }

    async fn listing(&mut self, dir: &str) -> StorageResult<Option<Vec<DirEntry>>> {
        let mut data = self.passive().await?;
        let reply = self.cmd(&format!("MLSD {dir}")).await?;
        let parser: fn(&str) -> Option<DirEntry> = match reply.code {
            125 | 150 => parse_mlsd_line,
            550 => return Ok(None),
            500 | 502 => {
                // No MLSD; retry with LIST on a fresh data connection.
                drop(data);
                data = self.passive().await?;
                let reply = self.cmd(&format!("LIST {dir}")).await?;
                match reply.code {
                    125 | 150 => parse_list_line,
                    450 | 550 => return Ok(None),
                    _ => return Err(reply_error(dir, "LIST", &reply)),
                }
            }
            _ => return Err(reply_error(dir, "MLSD", &reply)),
        };
        let mut raw = String::new();
        data.read_to_string(&mut raw).await.map_err(io_error)?;
        drop(data);
        self.finish_transfer(dir).await?;
        Ok(Some(raw.lines().filter_map(parser).collect()))
    }

    /// Create every missing directory along `dir`.
    async fn mkdirs(&mut self, dir: &str) -> StorageResult<()> {
        let mut current = String::new();
        for segment in dir.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            // 550 when the directory already exists.
            self.expect(dir, &format!("MKD {current}"), &[257, 550, 521])
                .await?;
        }
        Ok(())
    }

    async fn quit(mut self) {
        let _ = self.cmd("QUIT").await;
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FtpStorage {
    config: FtpConfig,
    base: String,
    signer: ProxySigner,
}

impl FtpStorage {
    pub fn new(config: &FtpConfig, signer: ProxySigner) -> Self {
        let base = format!("/{}", config.base_path.trim_matches('/'));
        Self {
            config: config.clone(),
            base: base.trim_end_matches('/').to_string(),
            signer,
        }
    }

    fn path_for(&self, key: &str) -> StorageResult<String> {
        validate_key(key)?;
        Ok(format!("{}/{}", self.base, key))
    }

    fn dir_for(&self, dir: &str) -> String {
        if dir.is_empty() {
            if self.base.is_empty() {
                "/".to_string()
            } else {
                self.base.clone()
            }
        } else {
            format!("{}/{}", self.base, dir)
        }
    }

    async fn session(&self) -> StorageResult<Session> {
        Session::open(&self.config).await
    }
}

#[async_trait]
impl StorageAdapter for FtpStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Ftp
    }

    #[instrument(skip(self, data, _opts), fields(host = %self.config.host, %key, len = data.len()))]
    async fn put(&self, key: &str, data: Bytes, _opts: &PutOptions) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let mut session = self.session().await?;
        let (parent, _) = split_parent(&path);
        session.mkdirs(parent).await?;
        session.store(key, &path, &data).await?;
        session.quit().await;
        debug!("file stored");
        Ok(())
    }

    #[instrument(skip(self, opts), fields(host = %self.config.host, %key))]
    async fn get(&self, key: &str, opts: &GetOptions) -> StorageResult<Bytes> {
        let path = self.path_for(key)?;
        let mut session = self.session().await?;
        let data = session.retrieve(key, &path).await?;
        session.quit().await;
        Ok(opts.apply(Bytes::from(data)))
    }

    #[instrument(skip(self, opts), fields(host = %self.config.host, prefix = %opts.prefix))]
    async fn list(&self, opts: &ListOptions) -> StorageResult<ListResult> {
        let mut session = self.session().await?;
        let mut objects = Vec::new();
        let mut pending = vec![prefix_dir(&opts.prefix).to_string()];

        while let Some(dir) = pending.pop() {
            let Some(entries) = session.listing(&self.dir_for(&dir)).await? else {
                continue;
            };
            for entry in entries {
                let key = if dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{dir}/{}", entry.name)
                };
                if entry.is_dir {
                    // Only descend where the prefix can still match.
                    let as_prefix = format!("{key}/");
                    if as_prefix.starts_with(&opts.prefix) || opts.prefix.starts_with(&as_prefix) {
                        pending.push(key);
                    }
                } else {
                    objects.push(StorageObject::new(
                        key,
                        entry.size,
                        entry.modified.unwrap_or_else(Utc::now),
                    ));
                }
            }
        }
        session.quit().await;
        Ok(fold_listing(objects, opts))
    }

    #[instrument(skip(self), fields(host = %self.config.host, %key))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let mut session = self.session().await?;
        let result = match session.expect(key, &format!("DELE {path}"), &[250]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        };
        session.quit().await;
        result
    }

    /// FTP has no server-side copy: download then upload.
    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        let data = self.get(src, &GetOptions::default()).await?;
        self.put(dst, data, &PutOptions::default()).await
    }

    async fn move_object(&self, src: &str, dst: &str) -> StorageResult<()> {
        let from = self.path_for(src)?;
        let to = self.path_for(dst)?;
        let mut session = self.session().await?;
        session.mkdirs(split_parent(&to).0).await?;
        session.expect(src, &format!("RNFR {from}"), &[350]).await?;
        session.expect(src, &format!("RNTO {to}"), &[250]).await?;
        session.quit().await;
        Ok(())
    }

    async fn stat(&self, key: &str) -> StorageResult<StorageObject> {
        let path = self.path_for(key)?;
        let mut session = self.session().await?;
        let size = session.expect(key, &format!("SIZE {path}"), &[213]).await?;
        let modified = session
            .cmd(&format!("MDTM {path}"))
            .await?
            .text
            .split_whitespace()
            .next()
            .and_then(parse_ftp_time);
        session.quit().await;
        Ok(StorageObject::new(
            key,
            size.text.trim().parse().unwrap_or(0),
            modified.unwrap_or_else(Utc::now),
        ))
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        validate_key(key)?;
        Ok(self.signer.url(ProxyOp::Get, key, expires_in))
    }

    async fn signed_upload_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        validate_key(key)?;
        Ok(self.signer.url(ProxyOp::Put, key, expires_in))
    }
}
