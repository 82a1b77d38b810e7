use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::{TcpListener, TcpSocket};

/// 创建 TCP 监听器
pub fn create_listener(host: IpAddr, port: u16) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;

    // 槽位端口在 worker 崩溃重启后复用，SO_REUSEADDR 避免 TIME_WAIT 导致绑定失败
    socket.set_reuseaddr(true)?;

    socket.bind(SocketAddr::new(host, port))?;
    let listener = socket.listen(1024)?;
    Ok(listener)
}
