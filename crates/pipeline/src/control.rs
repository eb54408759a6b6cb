//! TCP control channel.
//!
//! A plain line protocol on an optional listener: one command per line,
//! one response line back (the `list` response is a JSON array). Peers
//! must be loopback or explicitly allow-listed; sessions carry a read
//! timeout so a silent client cannot pin the thread. Commands that touch
//! stage state go through the same shared structures the executors use.

use crate::config::ControlOptions;
use crate::error::{PipelineError, PipelineResult};
use crate::supervisor::PipelineHandle;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// The listener thread plus its stop flag.
pub struct ControlServer {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl ControlServer {
    pub fn start(options: ControlOptions, handle: PipelineHandle) -> PipelineResult<Self> {
        let listener = bind_listener(&options)?;
        listener.set_nonblocking(true)?;
        info!(
            "control channel listening on {}:{}",
            options.local, options.port
        );
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("tsp-control".into())
            .spawn(move || serve(listener, options, handle, thread_stop))
            .map_err(|e| PipelineError::Allocation(format!("cannot start control thread: {e}")))?;
        Ok(Self { stop, thread })
    }

    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.thread.join();
    }
}

fn serve(
    listener: TcpListener,
    options: ControlOptions,
    handle: PipelineHandle,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if !peer_allowed(peer.ip(), &options.sources) {
                    warn!("rejected control connection from {peer}");
                    continue;
                }
                debug!("control session from {peer}");
                if let Err(e) = session(stream, &options, &handle) {
                    debug!("control session ended: {e}");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("control accept failed: {e}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Loopback is always welcome; anything else must be allow-listed.
fn peer_allowed(ip: IpAddr, sources: &[IpAddr]) -> bool {
    ip.is_loopback() || sources.contains(&ip)
}

fn session(
    stream: TcpStream,
    options: &ControlOptions,
    handle: &PipelineHandle,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(options.session_timeout))?;
    stream.set_write_timeout(Some(options.session_timeout))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        let (response, quit) = execute(command, handle);
        writer.write_all(response.as_bytes())?;
        writer.write_all(b"\n")?;
        if quit {
            return Ok(());
        }
    }
}

/// Runs one command line; returns the response and whether the session
/// should close.
fn execute(command: &str, handle: &PipelineHandle) -> (String, bool) {
    let mut parts = command.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let response = match verb {
        "list" => {
            return (
                serde_json::to_string(&handle.stage_infos())
                    .unwrap_or_else(|e| format!("error: {e}")),
                false,
            )
        }
        "bitrate" => Ok(format!("{} b/s", handle.bitrate())),
        "suspend" => match parts.next() {
            Some(sel) => handle.suspend(sel).map(|()| format!("suspended {sel}")),
            None => Err("usage: suspend <stage>".into()),
        },
        "resume" => match parts.next() {
            Some(sel) => handle.resume(sel).map(|()| format!("resumed {sel}")),
            None => Err("usage: resume <stage>".into()),
        },
        "setlog" => match (parts.next(), parts.next()) {
            (Some(sel), Some(level)) => handle
                .set_log(sel, level)
                .map(|()| format!("log level of {sel} set to {level}")),
            _ => Err("usage: setlog <stage> <level>".into()),
        },
        "exit" | "quit" => {
            handle.request_stop();
            return ("bye".into(), true);
        }
        other => Err(format!("unknown command '{other}'")),
    };
    match response {
        Ok(msg) => (msg, false),
        Err(msg) => (format!("error: {msg}"), false),
    }
}

#[cfg(unix)]
fn bind_listener(options: &ControlOptions) -> PipelineResult<TcpListener> {
    use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};
    use std::net::SocketAddrV4;
    use std::os::fd::AsRawFd;

    let IpAddr::V4(ip) = options.local else {
        return Err(PipelineError::Config(
            "control channel requires an IPv4 local address".into(),
        ));
    };
    let ctl = |e: nix::errno::Errno| PipelineError::Control(e.to_string());
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(ctl)?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(ctl)?;
    if options.reuse_port {
        socket::setsockopt(&fd, sockopt::ReusePort, &true).map_err(ctl)?;
    }
    let addr = SockaddrIn::from(SocketAddrV4::new(ip, options.port));
    socket::bind(fd.as_raw_fd(), &addr).map_err(ctl)?;
    socket::listen(&fd, 16).map_err(ctl)?;
    Ok(TcpListener::from(fd))
}

#[cfg(not(unix))]
fn bind_listener(options: &ControlOptions) -> PipelineResult<TcpListener> {
    if options.reuse_port {
        warn!("SO_REUSEPORT is not supported on this platform");
    }
    Ok(TcpListener::bind((options.local, options.port))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_always_allowed() {
        assert!(peer_allowed(IpAddr::from([127, 0, 0, 1]), &[]));
        assert!(!peer_allowed(IpAddr::from([192, 168, 1, 9]), &[]));
    }

    #[test]
    fn allow_list_extends_loopback() {
        let sources = vec![IpAddr::from([192, 168, 1, 9])];
        assert!(peer_allowed(IpAddr::from([192, 168, 1, 9]), &sources));
        assert!(peer_allowed(IpAddr::from([127, 0, 0, 1]), &sources));
        assert!(!peer_allowed(IpAddr::from([10, 0, 0, 1]), &sources));
    }
}
