use std::{
    fmt, fs, io,
    net::{AddrParseError, SocketAddr, ToSocketAddrs},
    path::PathBuf,
    pin::Pin,
    str::FromStr,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream, ReadBuf},
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
    time::timeout,
};

const ZERO_TIME: Duration = Duration::from_secs(0);

/// Unified tcp & unix address
#[derive(Clone, Debug)]
pub enum UnifyAddr {
    Socket(SocketAddr),
    Path(PathBuf),
}

impl fmt::Display for UnifyAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(s) => write!(f, "{}", s),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl FromStr for UnifyAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') {
            return Ok(Self::Path(PathBuf::from(s)));
        }
        match s.parse::<SocketAddr>() {
            Ok(a) => Ok(Self::Socket(a)),
            // not a literal IP, try resolving as a hostname; first result wins
            Err(e) => match s.to_socket_addrs() {
                Ok(mut addrs) => match addrs.next() {
                    Some(a) => Ok(Self::Socket(a)),
                    None => Err(e),
                },
                Err(_) => Err(e),
            },
        }
    }
}

/// Unified tcp & unix listener
pub enum UnifyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl UnifyListener {
    pub async fn bind(addr: &UnifyAddr) -> io::Result<Self> {
        match addr {
            UnifyAddr::Socket(a) => Ok(Self::Tcp(TcpListener::bind(a).await?)),
            UnifyAddr::Path(path) => {
                if path.exists() {
                    fs::remove_file(path)?;
                }
                Ok(Self::Unix(UnixListener::bind(path)?))
            }
        }
    }

    #[inline]
    pub async fn accept(&self) -> io::Result<UnifyStream> {
        match self {
            Self::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                Ok(UnifyStream::Tcp(stream))
            }
            Self::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(UnifyStream::Unix(stream))
            }
        }
    }

    /// The bound address; the port matters when binding to port 0
    pub fn local_addr(&self) -> io::Result<UnifyAddr> {
        match self {
            Self::Tcp(l) => Ok(UnifyAddr::Socket(l.local_addr()?)),
            Self::Unix(l) => {
                let addr = l.local_addr()?;
                Ok(UnifyAddr::Path(addr.as_pathname().unwrap_or_else(|| "".as_ref()).into()))
            }
        }
    }

    pub fn local_port(&self) -> io::Result<u16> {
        match self {
            Self::Tcp(l) => Ok(l.local_addr()?.port()),
            Self::Unix(_) => Ok(0),
        }
    }
}

impl fmt::Display for UnifyListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.local_addr() {
            Ok(addr) => write!(f, "listener {}", addr),
            Err(_) => write!(f, "listener unknown"),
        }
    }
}

/// Unified tcp & unix stream
#[derive(Debug)]
pub enum UnifyStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl UnifyStream {
    pub async fn connect(addr: &UnifyAddr) -> io::Result<Self> {
        match addr {
            UnifyAddr::Socket(a) => Ok(Self::Tcp(TcpStream::connect(a).await?)),
            UnifyAddr::Path(path) => Ok(Self::Unix(UnixStream::connect(path).await?)),
        }
    }

    pub async fn connect_timeout(addr: &UnifyAddr, connect_timeout: Duration) -> io::Result<Self> {
        if connect_timeout == ZERO_TIME {
            return Self::connect(addr).await;
        }
        match timeout(connect_timeout, Self::connect(addr)).await {
            Ok(r) => r,
            Err(e) => Err(e.into()),
        }
    }

    pub fn peer_addr(&self) -> io::Result<UnifyAddr> {
        match self {
            Self::Tcp(s) => Ok(UnifyAddr::Socket(s.peer_addr()?)),
            Self::Unix(s) => {
                let addr = s.peer_addr()?;
                Ok(UnifyAddr::Path(addr.as_pathname().unwrap_or_else(|| "".as_ref()).into()))
            }
        }
    }

    /// Our own endpoint of the connection; this is the address the peer
    /// can dial us back on
    pub fn local_addr(&self) -> io::Result<UnifyAddr> {
        match self {
            Self::Tcp(s) => Ok(UnifyAddr::Socket(s.local_addr()?)),
            Self::Unix(s) => {
                let addr = s.local_addr()?;
                Ok(UnifyAddr::Path(addr.as_pathname().unwrap_or_else(|| "".as_ref()).into()))
            }
        }
    }
}

impl fmt::Display for UnifyStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let addr = match self {
            Self::Tcp(s) => s.peer_addr().map(UnifyAddr::Socket).ok(),
            Self::Unix(_) => None,
        };
        match addr {
            Some(a) => write!(f, "conn {}", a),
            None => write!(f, "conn unknown"),
        }
    }
}

impl AsyncRead for UnifyStream {
    #[inline(always)]
    fn poll_read(
        self: Pin<&mut Self>, cx: &mut Context, buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UnifyStream {
    #[inline(always)]
    fn poll_write(
        self: Pin<&mut Self>, cx: &mut Context, buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::get_mut(self) {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    #[inline(always)]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    #[inline(always)]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Buffered stream with per-operation timeouts; zero timeout means wait
/// forever. Every framed exchange in the crate goes through one of these.
#[derive(Debug)]
pub struct UnifyBufStream {
    buf_stream: BufStream<UnifyStream>,
}

impl UnifyBufStream {
    pub fn new(stream: UnifyStream) -> Self {
        Self { buf_stream: BufStream::with_capacity(16 * 1024, 16 * 1024, stream) }
    }

    #[inline(always)]
    pub async fn close(&mut self) -> io::Result<()> {
        self.buf_stream.shutdown().await
    }

    #[inline]
    pub fn peer_addr(&self) -> io::Result<UnifyAddr> {
        self.buf_stream.get_ref().peer_addr()
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<UnifyAddr> {
        self.buf_stream.get_ref().local_addr()
    }

    pub async fn read_exact_timeout(
        &mut self, dst: &mut [u8], read_timeout: Duration,
    ) -> io::Result<usize> {
        if read_timeout == ZERO_TIME {
            return self.buf_stream.read_exact(dst).await;
        }
        match timeout(read_timeout, self.buf_stream.read_exact(dst)).await {
            Ok(r) => r,
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_timeout(&mut self, src: &[u8], write_timeout: Duration) -> io::Result<()> {
        if write_timeout == ZERO_TIME {
            return self.buf_stream.write_all(src).await;
        }
        match timeout(write_timeout, self.buf_stream.write_all(src)).await {
            Ok(r) => r,
            Err(e) => Err(e.into()),
        }
    }

    pub async fn flush_timeout(&mut self, write_timeout: Duration) -> io::Result<()> {
        if write_timeout == ZERO_TIME {
            return self.buf_stream.flush().await;
        }
        match timeout(write_timeout, self.buf_stream.flush()).await {
            Ok(r) => r,
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Display for UnifyBufStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.buf_stream.get_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_parse() {
        assert!(matches!(UnifyAddr::from_str("127.0.0.1:7800"), Ok(UnifyAddr::Socket(_))));
        assert!(matches!(UnifyAddr::from_str("/tmp/tether.sock"), Ok(UnifyAddr::Path(_))));
        assert!(UnifyAddr::from_str("definitely not an addr").is_err());
    }

    #[test]
    fn test_local_addr_reflects_dial() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let listener =
                UnifyListener::bind(&UnifyAddr::from_str("127.0.0.1:0").unwrap()).await.unwrap();
            let addr = listener.local_addr().unwrap();
            let stream = UnifyStream::connect(&addr).await.unwrap();
            match stream.local_addr().unwrap() {
                UnifyAddr::Socket(a) => {
                    assert_eq!(a.ip().to_string(), "127.0.0.1");
                    assert!(a.port() > 0);
                }
                UnifyAddr::Path(_) => panic!("expected a socket addr"),
            }
        });
    }
}
