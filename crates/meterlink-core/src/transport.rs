//! Framed call channel over any byte stream.
//!
//! [`StreamChannel`] is the client end. Calls from many threads share one
//! stream: each request frame is written whole under a write-only lock, and
//! a reader thread routes every reply to its caller by request id. A slow
//! call holds up only its own caller.
//!
//! [`serve_stream`] is the engine end: it reads requests, handles
//! fire-and-forget calls in arrival order, and answers each synchronous call
//! from its own thread.

use crossbeam_channel::{bounded, Sender};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::channel::{CallChannel, ChannelError};
use crate::protocol::{read_frame, write_frame, CallKind, Reply, Request};
use crate::value::{ValueError, WireValue};

/// Engine-side request handler.
pub trait Service: Send + Sync {
    /// Handle one call and produce its reply.
    ///
    /// The reply of a fire-and-forget call is discarded.
    fn handle(&self, class: &str, method: &str, args: &[WireValue]) -> Vec<WireValue>;
}

/// Callers waiting for replies, keyed by request id.
#[derive(Default)]
struct Pending {
    /// Set once the reader thread has stopped.
    closed: Option<String>,
    waiters: HashMap<u64, Sender<Vec<WireValue>>>,
}

/// Client end of a multiplexed request/reply stream.
pub struct StreamChannel {
    writer: Mutex<Box<dyn Write + Send>>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    closer: Option<TcpStream>,
}

impl StreamChannel {
    /// Build a channel from the two halves of a stream.
    ///
    /// Spawns the thread that reads replies from `reader`.
    pub fn new<R, W>(reader: R, writer: W) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let pending = Arc::new(Mutex::new(Pending::default()));
        let routes = pending.clone();
        thread::Builder::new()
            .name("stream-replies".to_string())
            .spawn(move || read_replies(reader, &routes))?;
        Ok(Self {
            writer: Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            closer: None,
        })
    }

    /// Connect to an engine listening on `addr`.
    pub fn connect_tcp<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let closer = stream.try_clone()?;
        let mut channel = Self::new(reader, stream)?;
        channel.closer = Some(closer);
        Ok(channel)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().expect("Pending calls lock poisoned")
    }

    fn check_open(&self) -> Result<(), ChannelError> {
        match &self.pending().closed {
            Some(reason) => Err(ChannelError::ConnectionLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn send(&self, request: Request) -> Result<(), ChannelError> {
        let body = request.encode()?;
        let mut writer = self.writer.lock().expect("Stream writer lock poisoned");
        write_frame(&mut *writer, &body).map_err(lost)
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        // Unblocks the reader thread.
        if let Some(stream) = &self.closer {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Route replies to their waiters until the stream ends.
fn read_replies<R: Read>(mut reader: R, pending: &Mutex<Pending>) {
    let reason = loop {
        match read_frame(&mut reader) {
            Ok(Some(body)) => match Reply::decode(&body) {
                Ok(reply) => {
                    let waiter = pending
                        .lock()
                        .expect("Pending calls lock poisoned")
                        .waiters
                        .remove(&reply.id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(reply.values);
                        }
                        None => log::debug!("Reply for unknown request {}", reply.id),
                    }
                }
                Err(e) => break format!("undecodable reply: {}", e),
            },
            Ok(None) => break "stream closed".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    log::debug!("Reply reader stopped: {}", reason);

    let mut pending = pending.lock().expect("Pending calls lock poisoned");
    pending.closed = Some(reason);
    // Dropping the senders wakes every waiting caller.
    pending.waiters.clear();
}

fn lost(e: io::Error) -> ChannelError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => ChannelError::ConnectionLost(e.to_string()),
        _ => ChannelError::Io(e),
    }
}

impl CallChannel for StreamChannel {
    fn call_synchronous(
        &self,
        class: &str,
        method: &str,
        args: &[WireValue],
    ) -> Result<Vec<WireValue>, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        {
            let mut pending = self.pending();
            if let Some(reason) = &pending.closed {
                return Err(ChannelError::ConnectionLost(reason.clone()));
            }
            pending.waiters.insert(id, tx);
        }

        let request = Request::new(id, CallKind::Synchronous, class, method, args);
        if let Err(e) = self.send(request) {
            self.pending().waiters.remove(&id);
            return Err(e);
        }

        rx.recv().map_err(|_| {
            let reason = self.pending().closed.clone();
            ChannelError::ConnectionLost(reason.unwrap_or_else(|| "stream closed".to_string()))
        })
    }

    fn call(&self, class: &str, method: &str, args: &[WireValue]) -> Result<(), ChannelError> {
        self.check_open()?;
        self.send(Request::new(0, CallKind::FireAndForget, class, method, args))
    }
}

fn invalid(e: ValueError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Serve requests until the peer closes the stream.
///
/// Returns once every synchronous call already read has been answered.
pub fn serve_stream<R, W>(mut reader: R, writer: W, service: &dyn Service) -> io::Result<()>
where
    R: Read,
    W: Write + Send,
{
    let writer = Mutex::new(writer);
    thread::scope(|scope| -> io::Result<()> {
        while let Some(body) = read_frame(&mut reader)? {
            let request = Request::decode(&body).map_err(invalid)?;
            log::trace!(
                "{}::{} #{} ({:?})",
                request.class,
                request.method,
                request.id,
                request.kind
            );

            match request.kind {
                CallKind::FireAndForget => {
                    service.handle(&request.class, &request.method, &request.args);
                }
                CallKind::Synchronous => {
                    let writer = &writer;
                    scope.spawn(move || {
                        let reply = Reply {
                            id: request.id,
                            values: service.handle(&request.class, &request.method, &request.args),
                        };
                        let sent = reply.encode().map_err(invalid).and_then(|body| {
                            let mut writer = writer.lock().expect("Reply writer lock poisoned");
                            write_frame(&mut *writer, &body)
                        });
                        if let Err(e) = sent {
                            log::debug!("Failed to answer request {}: {}", request.id, e);
                        }
                    });
                }
            }
        }
        Ok(())
    })
}

/// Accept TCP clients forever, serving each on its own thread.
pub fn serve_tcp(listener: TcpListener, service: Arc<dyn Service>) -> io::Result<()> {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Failed to accept client: {}", e);
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        log::info!("Client connected: {}", peer);

        let service = service.clone();
        thread::Builder::new()
            .name(format!("engine-client-{}", peer))
            .spawn(move || {
                let _ = stream.set_nodelay(true);
                let result = match stream.try_clone() {
                    Ok(reader) => serve_stream(reader, stream, service.as_ref()),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => log::info!("Client disconnected: {}", peer),
                    Err(e) => log::warn!("Client {} dropped: {}", peer, e),
                }
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// Echoes the arguments back and counts fire-and-forget calls.
    #[derive(Default)]
    struct EchoService {
        calls: AtomicUsize,
    }

    impl Service for EchoService {
        fn handle(&self, _class: &str, method: &str, args: &[WireValue]) -> Vec<WireValue> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut reply = vec![WireValue::from(method)];
            reply.extend_from_slice(args);
            reply
        }
    }

    fn spawn_engine() -> (std::net::SocketAddr, Arc<EchoService>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let service = Arc::new(EchoService::default());
        let served: Arc<dyn Service> = service.clone();
        thread::spawn(move || serve_tcp(listener, served));
        (addr, service)
    }

    #[test]
    fn test_synchronous_call_over_tcp() {
        let (addr, _service) = spawn_engine();
        let channel = StreamChannel::connect_tcp(addr).unwrap();

        let reply = channel
            .call_synchronous("Volmeter", "Query", &[WireValue::UInt64(3)])
            .unwrap();
        assert_eq!(
            reply,
            vec![WireValue::from("Query"), WireValue::UInt64(3)]
        );
    }

    #[test]
    fn test_fire_and_forget_gets_no_reply() {
        let (addr, service) = spawn_engine();
        let channel = StreamChannel::connect_tcp(addr).unwrap();

        channel.call("Volmeter", "Detach", &[WireValue::UInt64(1)]).unwrap();
        // The next synchronous reply must be its own, not a stray one.
        let reply = channel.call_synchronous("Volmeter", "Ping", &[]).unwrap();
        assert_eq!(reply, vec![WireValue::from("Ping")]);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_callers_do_not_interleave() {
        let (addr, _service) = spawn_engine();
        let channel = Arc::new(StreamChannel::connect_tcp(addr).unwrap());

        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let channel = channel.clone();
                thread::spawn(move || {
                    for i in 0..50u64 {
                        let marker = worker * 1000 + i;
                        let reply = channel
                            .call_synchronous("Volmeter", "Query", &[WireValue::UInt64(marker)])
                            .unwrap();
                        assert_eq!(reply[1], WireValue::UInt64(marker));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_closed_stream_reports_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            // Accept, read one frame, then hang up without replying.
            let (mut stream, _) = listener.accept().unwrap();
            let _ = read_frame(&mut stream);
        });

        let channel = StreamChannel::connect_tcp(addr).unwrap();
        let err = channel.call_synchronous("Volmeter", "Query", &[]).unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionLost(_)));

        // Later calls fail immediately instead of waiting on a dead stream.
        let err = channel.call_synchronous("Volmeter", "Query", &[]).unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionLost(_)));
        let err = channel.call("Volmeter", "Detach", &[]).unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionLost(_)));
    }

    /// Holds every `Query` for a while; everything else answers at once.
    #[derive(Default)]
    struct SlowQueryService {
        attached: AtomicUsize,
    }

    impl Service for SlowQueryService {
        fn handle(&self, _class: &str, method: &str, _args: &[WireValue]) -> Vec<WireValue> {
            match method {
                "Query" => {
                    thread::sleep(Duration::from_millis(800));
                    vec![WireValue::from("levels")]
                }
                "Attach" => {
                    self.attached.fetch_add(1, Ordering::SeqCst);
                    Vec::new()
                }
                "GetUpdateInterval" => vec![WireValue::UInt32(50)],
                _ => Vec::new(),
            }
        }
    }

    #[test]
    fn test_slow_query_does_not_block_other_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let service = Arc::new(SlowQueryService::default());
        let served: Arc<dyn Service> = service.clone();
        thread::spawn(move || serve_tcp(listener, served));
        let channel = Arc::new(StreamChannel::connect_tcp(addr).unwrap());

        let querying = {
            let channel = channel.clone();
            thread::spawn(move || channel.call_synchronous("Volmeter", "Query", &[]))
        };
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        channel.call("Volmeter", "Attach", &[WireValue::UInt64(1)]).unwrap();
        let interval = channel
            .call_synchronous("Volmeter", "GetUpdateInterval", &[])
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(interval, vec![WireValue::UInt32(50)]);
        // Fire-and-forget calls are handled before later requests are read.
        assert_eq!(service.attached.load(Ordering::SeqCst), 1);

        let levels = querying.join().unwrap().unwrap();
        assert_eq!(levels, vec![WireValue::from("levels")]);
    }
}
