//! In-process parent for driving a real child session over TLS.

#![allow(dead_code)]

use afterglow::message::{decode_line, Event};
use afterglow::protocol::frame;
use afterglow::protocol_core::{read_frame, write_frame, Frame};
use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// Write a fresh PKCS#8 key with the given mode.
pub fn write_key(dir: &Path, mode: u32) -> Result<PathBuf> {
    let key = rcgen::KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)?;
    let path = dir.join("child_key.pem");
    std::fs::write(&path, key.serialize_pem())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(path)
}

pub fn free_port() -> Result<u16> {
    let sock = std::net::TcpListener::bind("127.0.0.1:0")?;
    let p = sock.local_addr()?.port();
    drop(sock);
    Ok(p)
}

fn acceptor() -> Result<TlsAcceptor> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let der = CertificateDer::from(cert.serialize_der()?);
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![der], key)?;
    Ok(TlsAcceptor::from(Arc::new(cfg)))
}

/// What the parent serves and how it answers.
pub struct Parent {
    /// tag -> file body; `None` makes the parent refuse that tag
    pub files: Vec<(String, Option<Vec<u8>>)>,
    pub ack: bool,
}

impl Parent {
    pub fn serving(files: &[(&str, Option<&[u8]>)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(t, b)| (t.to_string(), b.map(|b| b.to_vec())))
                .collect(),
            ack: true,
        }
    }

    /// Dial the child, serve requests and return the control events seen
    /// up to and including the first `terminate`.
    pub async fn connect(&self, port: u16) -> Result<Vec<Event>> {
        let tcp = dial(port).await?;
        let mut io = acceptor()?.accept(tcp).await.context("tls accept")?;

        let mut seen = Vec::new();
        let mut pending = Vec::new();
        while let Some(f) = read_frame(&mut io).await? {
            match f.kind {
                frame::OPEN => {
                    let tag = String::from_utf8(f.payload)?;
                    let body = self
                        .files
                        .iter()
                        .find(|(t, _)| *t == tag)
                        .and_then(|(_, b)| b.clone());
                    match body {
                        Some(body) => {
                            let total = (body.len() as u64).to_le_bytes().to_vec();
                            write_frame(&mut io, &Frame::new(frame::FILE_START, f.stream, total)).await?;
                            for chunk in body.chunks(16 * 1024) {
                                write_frame(&mut io, &Frame::new(frame::FILE_DATA, f.stream, chunk.to_vec())).await?;
                            }
                            write_frame(&mut io, &Frame::new(frame::FILE_END, f.stream, Vec::new())).await?;
                        }
                        None => {
                            let msg = format!("no file for tag {tag}").into_bytes();
                            write_frame(&mut io, &Frame::new(frame::FILE_ERROR, f.stream, msg)).await?;
                        }
                    }
                }
                frame::CONTROL => {
                    pending.extend_from_slice(&f.payload);
                    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        let Some(event) = decode_line(std::str::from_utf8(&line)?.trim())? else {
                            continue;
                        };
                        let done = matches!(event, Event::Terminate { .. });
                        if let Event::Terminate { exit_code } = event {
                            if self.ack {
                                let reply = format!("{{\"terminate_ack\": {exit_code}}}\n");
                                write_frame(&mut io, &Frame::new(frame::CONTROL, 0, reply.into_bytes())).await?;
                            }
                        }
                        seen.push(event);
                        if done {
                            return Ok(seen);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(seen)
    }
}

/// Dial the child and never answer: leave every request pending and
/// collect control events until the child closes the session.
pub async fn watch(port: u16) -> Result<Vec<Event>> {
    let tcp = dial(port).await?;
    let mut io = acceptor()?.accept(tcp).await.context("tls accept")?;

    let mut seen = Vec::new();
    let mut pending = Vec::new();
    while let Some(f) = read_frame(&mut io).await? {
        if f.kind != frame::CONTROL {
            continue;
        }
        pending.extend_from_slice(&f.payload);
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            if let Some(event) = decode_line(std::str::from_utf8(&line)?.trim())? {
                seen.push(event);
            }
        }
    }
    Ok(seen)
}

async fn dial(port: u16) -> Result<TcpStream> {
    for _ in 0..100u32 {
        if let Ok(s) = TcpStream::connect(("127.0.0.1", port)).await {
            return Ok(s);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("child never started listening on {port}")
}

pub fn requested(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::RequestFile { tag } => Some(tag.clone()),
            _ => None,
        })
        .collect()
}
