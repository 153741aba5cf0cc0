//! Non-real-time bridge carrying GPIO data blobs between the RT thread and
//! an external UI daemon over unix datagram sockets.
//!
//! Two worker threads shuttle blobs between the sockets and a pair of
//! wait-free SPSC rings; the RT side only ever touches the rings. One
//! datagram carries exactly one blob.

use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use raspa_rt::SpscRing;

use crate::error::{ErrorKind, RaspaError};
use crate::packet::{GpioDataBlob, GPIO_DATA_BLOB_SIZE};

/// Local endpoint the bridge binds.
pub const GPIO_LOCAL_SOCKET: &str = "/tmp/raspa";

/// Endpoint of the UI daemon the bridge talks to.
pub const GPIO_PEER_SOCKET: &str = "/tmp/sensei";

/// Blobs each direction can hold between the RT thread and the workers.
const GPIO_RING_CAPACITY: usize = 100;

const SOCKET_TIMEOUT: Duration = Duration::from_millis(250);

/// Polling interval of the writer worker; not a timeout.
const WRITE_LOOP_PERIOD: Duration = Duration::from_millis(100);

/// Backoff while waiting for the RT thread to drain a full ring.
const WAIT_FOR_RT_RING: Duration = Duration::from_millis(10);

/// Socket endpoints, overridable so tests can run side by side.
#[derive(Debug, Clone)]
pub struct GpioSocketPaths {
    pub local: PathBuf,
    pub peer: PathBuf,
}

impl Default for GpioSocketPaths {
    fn default() -> Self {
        Self {
            local: PathBuf::from(GPIO_LOCAL_SOCKET),
            peer: PathBuf::from(GPIO_PEER_SOCKET),
        }
    }
}

pub struct GpioBridge {
    /// Blobs received from the daemon, waiting for the RT thread to pack
    /// them into tx control packets.
    to_rt: Arc<SpscRing<GpioDataBlob>>,
    /// Blobs harvested from rx control packets, waiting for the writer
    /// worker to send them to the daemon.
    from_rt: Arc<SpscRing<GpioDataBlob>>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    local_path: PathBuf,
}

impl GpioBridge {
    /// Create sockets, bind the local endpoint, start both workers. A peer
    /// that is not yet listening is not an error; the writer keeps trying.
    pub fn start(paths: &GpioSocketPaths) -> Result<Self, RaspaError> {
        // Clear the endpoint in case a previous run crashed.
        let _ = std::fs::remove_file(&paths.local);

        let in_socket = UnixDatagram::bind(&paths.local)
            .map_err(|e| RaspaError::from_os(ErrorKind::InputSocketBind, &e))?;
        in_socket
            .set_read_timeout(Some(SOCKET_TIMEOUT))
            .map_err(|e| RaspaError::from_os(ErrorKind::InputSocketTimeout, &e))?;

        let out_socket = UnixDatagram::unbound()
            .map_err(|e| RaspaError::from_os(ErrorKind::OutputSocketCreation, &e))?;
        if connect_to_peer(&out_socket, &paths.peer) {
            tracing::debug!(peer = %paths.peer.display(), "gpio peer connected at startup");
        }

        let to_rt = Arc::new(SpscRing::new(GPIO_RING_CAPACITY));
        let from_rt = Arc::new(SpscRing::new(GPIO_RING_CAPACITY));
        let running = Arc::new(AtomicBool::new(true));

        let reader = {
            let ring = Arc::clone(&to_rt);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("raspa-gpio-rx".into())
                .spawn(move || read_from_socket_loop(in_socket, ring, running))
                .map_err(|e| RaspaError::from_os(ErrorKind::InputSocketCreation, &e))?
        };

        let writer = {
            let ring = Arc::clone(&from_rt);
            let running = Arc::clone(&running);
            let peer = paths.peer.clone();
            std::thread::Builder::new()
                .name("raspa-gpio-tx".into())
                .spawn(move || write_to_socket_loop(out_socket, peer, ring, running))
                .map_err(|e| RaspaError::from_os(ErrorKind::OutputSocketCreation, &e))?
        };

        Ok(Self {
            to_rt,
            from_rt,
            running,
            reader: Some(reader),
            writer: Some(writer),
            local_path: paths.local.clone(),
        })
    }

    /// RT side: queue a blob harvested from an rx packet for the daemon.
    /// Returns false when the ring is full; the blob is dropped at the
    /// sender in that case.
    #[inline]
    pub fn try_push_to_nrt(&self, blob: GpioDataBlob) -> bool {
        self.from_rt.try_push(blob).is_ok()
    }

    /// RT side: take one daemon blob destined for the next tx packet.
    #[inline]
    pub fn try_pop_from_nrt(&self) -> Option<GpioDataBlob> {
        self.to_rt.try_pop().ok()
    }

    /// RT side: daemon blobs are waiting to go out to the companion.
    #[inline]
    pub fn has_outbound(&self) -> bool {
        !self.to_rt.was_empty()
    }

    /// Signal the workers, join them, unlink the local endpoint.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.local_path);
    }
}

impl Drop for GpioBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

fn connect_to_peer(socket: &UnixDatagram, peer: &Path) -> bool {
    if socket.connect(peer).is_err() {
        return false;
    }
    if let Err(err) = socket.set_write_timeout(Some(SOCKET_TIMEOUT)) {
        tracing::warn!(?err, "failed to set gpio send timeout");
        return false;
    }
    true
}

fn send_blob(socket: &UnixDatagram, blob: &GpioDataBlob) -> bool {
    matches!(socket.send(&blob.0), Ok(n) if n == GPIO_DATA_BLOB_SIZE)
}

/// Receive one blob at a time and hand it to the RT thread. A full ring is
/// never a reason to drop: the worker holds on to the blob and retries after
/// a short sleep, since the RT thread drains faster than the daemon sends.
fn read_from_socket_loop(
    socket: UnixDatagram,
    ring: Arc<SpscRing<GpioDataBlob>>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; GPIO_DATA_BLOB_SIZE];

    while running.load(Ordering::Acquire) {
        match socket.recv(&mut buf) {
            Ok(n) if n == GPIO_DATA_BLOB_SIZE => {
                let blob = GpioDataBlob(buf);
                while ring.try_push(blob).is_err() {
                    if !running.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::sleep(WAIT_FOR_RT_RING);
                }
            }
            Ok(n) => {
                tracing::warn!(bytes = n, "dropping gpio datagram of unexpected size");
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                tracing::warn!(?err, "gpio receive failed");
            }
        }
    }
}

/// Drain the from-RT ring into the peer socket every wake-up. A failed send
/// keeps the blob and tries to reconnect on the next pass.
fn write_to_socket_loop(
    socket: UnixDatagram,
    peer: PathBuf,
    ring: Arc<SpscRing<GpioDataBlob>>,
    running: Arc<AtomicBool>,
) {
    let mut pending: Option<GpioDataBlob> = None;
    let mut connected = connect_to_peer(&socket, &peer);

    while running.load(Ordering::Acquire) && !connected {
        std::thread::sleep(WRITE_LOOP_PERIOD);
        connected = connect_to_peer(&socket, &peer);
    }

    while running.load(Ordering::Acquire) {
        if let Some(blob) = pending {
            if connect_to_peer(&socket, &peer) && send_blob(&socket, &blob) {
                pending = None;
            } else {
                tracing::debug!("gpio peer unreachable, retrying");
            }
        } else {
            while let Ok(blob) = ring.try_pop() {
                if !send_blob(&socket, &blob) {
                    pending = Some(blob);
                    break;
                }
            }
        }

        std::thread::sleep(WRITE_LOOP_PERIOD);
    }
}
