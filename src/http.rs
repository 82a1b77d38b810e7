use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 请求/响应头的最大长度，超过按非法数据处理
const MAX_HEAD_SIZE: usize = 32768;

/// 已解析的请求头。buf 保存目前读到的全部原始字节（可能带上一段 body 前缀），
/// 转发时原样写给上游即可
#[derive(Debug)]
pub struct RequestHead {
    pub buf: Vec<u8>,
    pub header_end: usize,
    pub method: String,
    pub path: String,
    pub content_length: usize,
    pub chunked: bool,
    pub keep_alive: bool,
}

impl RequestHead {
    /// buf 中随头一起读到的 body 前缀
    pub fn body_prefix(&self) -> &[u8] {
        &self.buf[self.header_end..]
    }
}

/// 上游响应头里与转发相关的信息
#[derive(Debug)]
pub struct ResponseInfo {
    pub keep_alive: bool,
    pub content_length: Option<usize>,
    pub chunked: bool,
}

/// 上游响应头及随头一起读到的 body 前缀
pub struct ResponseHead {
    pub header: Vec<u8>,
    pub body_prefix: Vec<u8>,
    pub info: ResponseInfo,
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// 读取一个请求头。连接在请求边界上正常关闭时返回 None
pub async fn read_request_head<R>(stream: &mut R) -> io::Result<Option<RequestHead>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut temp = [0u8; 4096];

    loop {
        let n = stream.read(&mut temp).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "client closed mid-request"));
        }
        buf.extend_from_slice(&temp[..n]);
        if buf.len() > MAX_HEAD_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "header too large"));
        }
        if let Some(end) = find_header_end(&buf) {
            return parse_request_head(buf, end).map(Some);
        }
    }
}

fn parse_request_head(buf: Vec<u8>, header_end: usize) -> io::Result<RequestHead> {
    let (method, path, content_length, chunked, keep_alive) = {
        let head_str = String::from_utf8_lossy(&buf[..header_end]);
        let mut lines = head_str.lines();
        let first_line = lines.next().unwrap_or("");
        let mut parts = first_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();
        let version = parts.next().unwrap_or("").to_string();

        if method.is_empty() || path.is_empty() || version.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed request line"));
        }

        let is_http10 = version == "HTTP/1.0";
        let mut connection: Option<String> = None;
        let mut content_length = 0usize;
        let mut chunked = false;

        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim().to_ascii_lowercase();
                let value = value.trim().to_ascii_lowercase();
                match key.as_str() {
                    "connection" => connection = Some(value),
                    "content-length" => content_length = value.parse().unwrap_or(0),
                    "transfer-encoding" => {
                        if value.contains("chunked") {
                            chunked = true;
                        }
                    }
                    _ => {}
                }
            }
        }

        // chunked 优先于 Content-Length
        if chunked {
            content_length = 0;
        }

        // HTTP/1.1 默认保活，HTTP/1.0 需要显式声明
        let keep_alive = if is_http10 {
            connection.as_deref().map(|v| v.contains("keep-alive")).unwrap_or(false)
        } else {
            !connection.as_deref().map(|v| v.contains("close")).unwrap_or(false)
        };

        (method, path, content_length, chunked, keep_alive)
    };

    Ok(RequestHead {
        buf,
        header_end,
        method,
        path,
        content_length,
        chunked,
        keep_alive,
    })
}

/// 读完请求 body（含 buf 中已有的前缀）。chunked 请求解码成纯 payload，
/// 其余按 Content-Length 读；读够之前对端关闭算错误
pub async fn read_request_body<R>(stream: &mut R, head: &RequestHead) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if head.chunked {
        return read_chunked_body(stream, head.body_prefix().to_vec()).await;
    }

    let mut body = head.body_prefix().to_vec();
    let mut temp = [0u8; 4096];
    while body.len() < head.content_length {
        let n = stream.read(&mut temp).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "client closed mid-body"));
        }
        body.extend_from_slice(&temp[..n]);
    }
    body.truncate(head.content_length);
    Ok(body)
}

/// 解码一个 chunked body，返回拼好的 payload 字节
async fn read_chunked_body<R>(stream: &mut R, mut buffer: Vec<u8>) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut parse_pos = 0usize;
    let mut temp = [0u8; 4096];

    loop {
        let line_end = match buffer[parse_pos..].windows(2).position(|w| w == b"\r\n") {
            Some(pos) => parse_pos + pos,
            None => {
                let n = stream.read(&mut temp).await?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunked eof"));
                }
                buffer.extend_from_slice(&temp[..n]);
                continue;
            }
        };

        let size = parse_chunk_size(&buffer[parse_pos..line_end])?;
        let after_line = line_end + 2;

        if size == 0 {
            // 末尾 chunk：吃掉 trailer 直到结尾空行
            loop {
                if buffer[line_end..].windows(4).any(|w| w == b"\r\n\r\n") {
                    return Ok(body);
                }
                let n = stream.read(&mut temp).await?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunked eof"));
                }
                buffer.extend_from_slice(&temp[..n]);
            }
        }

        let needed = after_line + size + 2;
        while buffer.len() < needed {
            let n = stream.read(&mut temp).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunked eof"));
            }
            buffer.extend_from_slice(&temp[..n]);
        }
        body.extend_from_slice(&buffer[after_line..after_line + size]);
        parse_pos = needed;
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Unknown",
    }
}

/// 写出一个 JSON 响应
pub async fn write_json_response<W>(
    stream: &mut W,
    status: u16,
    body: &str,
    keep_alive: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        status,
        reason_phrase(status),
        body.len(),
        if keep_alive { "keep-alive" } else { "close" }
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await
}

/// 读取上游响应头，body 前缀一并带回
pub async fn read_response_head<R>(stream: &mut R) -> io::Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(4096);
    let mut temp = [0u8; 4096];

    loop {
        let n = stream.read(&mut temp).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "upstream closed"));
        }
        buffer.extend_from_slice(&temp[..n]);
        if buffer.len() > MAX_HEAD_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "header too large"));
        }
        if let Some(end) = find_header_end(&buffer) {
            let header = buffer[..end].to_vec();
            let body_prefix = buffer[end..].to_vec();
            let info = parse_response_info(&header);
            return Ok(ResponseHead {
                header,
                body_prefix,
                info,
            });
        }
    }
}

fn parse_response_info(header: &[u8]) -> ResponseInfo {
    let header_str = String::from_utf8_lossy(header);
    let mut lines = header_str.lines();
    let status_line = lines.next().unwrap_or("");
    let is_http10 = status_line.starts_with("HTTP/1.0");
    let mut connection: Option<String> = None;
    let mut content_length: Option<usize> = None;
    let mut chunked = false;

    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_ascii_lowercase();
            match key.as_str() {
                "connection" => connection = Some(value),
                "content-length" => content_length = value.parse::<usize>().ok(),
                "transfer-encoding" => {
                    if value.contains("chunked") {
                        chunked = true;
                    }
                }
                _ => {}
            }
        }
    }

    let keep_alive = if is_http10 {
        connection.as_deref().map(|v| v.contains("keep-alive")).unwrap_or(false)
    } else {
        !connection.as_deref().map(|v| v.contains("close")).unwrap_or(false)
    };

    ResponseInfo {
        keep_alive,
        content_length,
        chunked,
    }
}

/// 按 Content-Length 搬运固定长度的 body，already_sent 为已经写出的前缀长度。
/// 读够之前来源就关闭算错误，截断必须让连接死掉而不是装作成功
pub async fn relay_content_length<R, W>(
    from: &mut R,
    to: &mut W,
    content_length: usize,
    already_sent: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = content_length.saturating_sub(already_sent);
    let mut temp = [0u8; 4096];
    while remaining > 0 {
        let n = from.read(&mut temp).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof before content length"));
        }
        let to_write = n.min(remaining);
        to.write_all(&temp[..to_write]).await?;
        remaining -= to_write;
    }
    to.flush().await
}

/// 搬运到上游关闭连接为止（响应没有长度信息时的兜底）
pub async fn relay_until_eof<R, W>(from: &mut R, to: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut temp = [0u8; 4096];
    loop {
        let n = from.read(&mut temp).await?;
        if n == 0 {
            break;
        }
        to.write_all(&temp[..n]).await?;
    }
    to.flush().await
}

/// 搬运 chunked body：字节原样转发，解析只用来判断结束位置
pub async fn relay_chunked<R, W>(from: &mut R, to: &mut W, mut buffer: Vec<u8>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !buffer.is_empty() {
        to.write_all(&buffer).await?;
    }

    let mut parse_pos = 0usize;
    let mut temp = [0u8; 4096];

    loop {
        let line_end = match buffer[parse_pos..].windows(2).position(|w| w == b"\r\n") {
            Some(pos) => parse_pos + pos,
            None => {
                let n = from.read(&mut temp).await?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunked eof"));
                }
                buffer.extend_from_slice(&temp[..n]);
                to.write_all(&temp[..n]).await?;
                continue;
            }
        };

        let size = parse_chunk_size(&buffer[parse_pos..line_end])?;
        let after_line = line_end + 2;

        if size == 0 {
            // 末尾 chunk：读到结尾空行为止（从 size 行自己的 CRLF 开始找，兼容无 trailer 的情况）
            loop {
                if buffer[line_end..].windows(4).any(|w| w == b"\r\n\r\n") {
                    return to.flush().await;
                }
                let n = from.read(&mut temp).await?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunked eof"));
                }
                buffer.extend_from_slice(&temp[..n]);
                to.write_all(&temp[..n]).await?;
            }
        }

        let needed = after_line + size + 2;
        while buffer.len() < needed {
            let n = from.read(&mut temp).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunked eof"));
            }
            buffer.extend_from_slice(&temp[..n]);
            to.write_all(&temp[..n]).await?;
        }
        parse_pos = needed;
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<usize> {
    let mut end = line.len();
    if let Some(pos) = line.iter().position(|b| *b == b';') {
        end = pos;
    }
    let size_str = String::from_utf8_lossy(&line[..end]);
    usize::from_str_radix(size_str.trim(), 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_request_head_and_body() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(b"POST /api/users HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nabcd")
            .await
            .unwrap();
        drop(client);

        let head = read_request_head(&mut server).await.unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/api/users");
        assert_eq!(head.content_length, 4);
        assert!(head.keep_alive);

        let body = read_request_body(&mut server, &head).await.unwrap();
        assert_eq!(body, b"abcd");
    }

    #[tokio::test]
    async fn decodes_chunked_request_body() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(
                b"POST /api/users HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
                  4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
            )
            .await
            .unwrap();

        let head = read_request_head(&mut server).await.unwrap().unwrap();
        assert!(head.chunked);
        assert_eq!(head.content_length, 0);

        let body = read_request_body(&mut server, &head).await.unwrap();
        assert_eq!(body, b"wikipedia");
    }

    #[tokio::test]
    async fn chunked_body_split_across_reads_is_reassembled() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        let head = read_request_head(&mut server).await.unwrap().unwrap();

        let reader = tokio::spawn(async move { read_request_body(&mut server, &head).await });
        client.write_all(b"6\r\nab").await.unwrap();
        client.write_all(b"cdef\r\n0\r\n").await.unwrap();
        client.write_all(b"\r\n").await.unwrap();

        let body = reader.await.unwrap().unwrap();
        assert_eq!(body, b"abcdef");
    }

    #[tokio::test]
    async fn eof_before_content_length_body_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc")
            .await
            .unwrap();
        drop(client);

        let head = read_request_head(&mut server).await.unwrap().unwrap();
        let err = read_request_body(&mut server, &head).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn eof_mid_chunked_body_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nab")
            .await
            .unwrap();
        drop(client);

        let head = read_request_head(&mut server).await.unwrap().unwrap();
        let err = read_request_body(&mut server, &head).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn truncated_relay_is_an_error_not_success() {
        let (mut from_tx, mut from_rx) = tokio::io::duplex(4096);
        let (mut to_tx, _to_rx) = tokio::io::duplex(4096);

        // 承诺 10 字节只给 3 字节就断开
        from_tx.write_all(b"abc").await.unwrap();
        drop(from_tx);

        let err = relay_content_length(&mut from_rx, &mut to_tx, 10, 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn clean_eof_between_requests_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_request_head(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connection_close_disables_keep_alive() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let head = read_request_head(&mut server).await.unwrap().unwrap();
        assert!(!head.keep_alive);
    }

    #[test]
    fn response_info_defaults_follow_http_version() {
        let info = parse_response_info(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n");
        assert!(info.keep_alive);
        assert_eq!(info.content_length, Some(2));

        let info = parse_response_info(b"HTTP/1.0 200 OK\r\n\r\n");
        assert!(!info.keep_alive);

        let info = parse_response_info(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert!(info.chunked);
    }

    #[test]
    fn chunk_size_is_hex_with_optional_extension() {
        assert_eq!(parse_chunk_size(b"1a").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"4;ext=1").unwrap(), 4);
        assert!(parse_chunk_size(b"zz").is_err());
    }

    #[tokio::test]
    async fn relays_chunked_body_verbatim() {
        let (mut upstream_tx, mut upstream_rx) = tokio::io::duplex(4096);
        let (mut client_tx, mut client_rx) = tokio::io::duplex(4096);

        let raw = b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
        upstream_tx.write_all(raw).await.unwrap();
        drop(upstream_tx);

        relay_chunked(&mut upstream_rx, &mut client_tx, Vec::new()).await.unwrap();
        drop(client_tx);

        let mut out = Vec::new();
        client_rx.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, raw);
    }
}
