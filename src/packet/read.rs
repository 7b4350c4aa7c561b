use std::io;
use std::time::Duration;

use smol::{
    Timer, future,
    io::{AsyncRead, AsyncReadExt},
};

use super::{HeaderMap, HttpError, Packet, ReadError, find_subslice};

const READ_CHUNK: usize = 8192;

/// Single read racing the socket against a deadline.
pub async fn read_timeout<S>(
    stream: &mut S,
    buf: &mut [u8],
    timeout: Duration,
) -> io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    future::or(async { stream.read(buf).await }, async {
        Timer::after(timeout).await;
        Err(io::ErrorKind::TimedOut.into())
    })
    .await
}

/// Reads one complete HTTP message off `stream`.
///
/// `carry` holds bytes read past the previous message; on return it holds
/// whatever belongs to the next pipelined message. The body is de-framed per
/// `Content-Length` first, then chunked transfer-encoding; `set_content`
/// rewrites the framing headers so the packet always re-encodes
/// length-delimited.
pub async fn read_packet<S, P>(
    stream: &mut S,
    carry: &mut Vec<u8>,
    timeout: Duration,
) -> Result<P, ReadError>
where
    S: AsyncRead + Unpin,
    P: Packet,
{
    let head_end = loop {
        if let Some(pos) = find_subslice(carry, b"\r\n\r\n") {
            break pos;
        }
        fill(stream, carry, timeout).await?;
    };

    let rest = carry.split_off(head_end + 4);
    let head = std::mem::replace(carry, rest);
    let mut packet = P::parse_head(&head[..head_end])?;

    let content_length = match packet.headers().get(b"Content-Length") {
        Some(raw) => Some(parse_content_length(raw)?),
        None => None,
    };

    if let Some(body_len) = content_length {
        while carry.len() < body_len {
            fill(stream, carry, timeout).await?;
        }
        let rest = carry.split_off(body_len);
        let body = std::mem::replace(carry, rest);
        packet.set_content(body);
    } else if has_chunked_token(packet.headers()) {
        let body = read_chunked(stream, carry, timeout).await?;
        packet.set_content(body);
    }

    packet.validate()?;
    Ok(packet)
}

fn parse_content_length(raw: &[u8]) -> Result<usize, HttpError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .ok_or(HttpError::BadRequest)
}

fn has_chunked_token(headers: &HeaderMap) -> bool {
    headers.get(b"Transfer-Encoding").is_some_and(|te| {
        te.split(|&b| b == b',')
            .any(|token| token.trim_ascii() == b"chunked")
    })
}

/// De-frames `HEX-SIZE CRLF data CRLF` chunks up to the zero chunk, then
/// discards trailer headers through the blank line.
async fn read_chunked<S>(
    stream: &mut S,
    carry: &mut Vec<u8>,
    timeout: Duration,
) -> Result<Vec<u8>, ReadError>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let (consumed, size) = loop {
            match httparse::parse_chunk_size(carry) {
                Ok(httparse::Status::Complete(parsed)) => break parsed,
                Ok(httparse::Status::Partial) => fill(stream, carry, timeout).await?,
                Err(_) => return Err(HttpError::BadRequest.into()),
            }
        };
        carry.drain(..consumed);

        if size == 0 {
            break;
        }
        let size = size as usize;

        // chunk data plus its trailing CRLF
        while carry.len() < size + 2 {
            fill(stream, carry, timeout).await?;
        }
        body.extend_from_slice(&carry[..size]);
        carry.drain(..size + 2);
    }

    loop {
        let pos = loop {
            if let Some(pos) = find_subslice(carry, b"\r\n") {
                break pos;
            }
            fill(stream, carry, timeout).await?;
        };
        let blank = pos == 0;
        carry.drain(..pos + 2);
        if blank {
            return Ok(body);
        }
    }
}

async fn fill<S>(stream: &mut S, buf: &mut Vec<u8>, timeout: Duration) -> Result<(), ReadError>
where
    S: AsyncRead + Unpin,
{
    let mut tmp = [0u8; READ_CHUNK];
    let n = read_timeout(stream, &mut tmp, timeout).await?;
    if n == 0 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    buf.extend_from_slice(&tmp[..n]);
    Ok(())
}
