#![doc = include_str!("../README.md")]

pub mod ca;
pub mod lockdown;
pub mod message;
pub mod pairing;
pub mod prefs;
pub mod provider;
mod tls;
mod util;

pub use lockdown::LockdownClient;
pub use prefs::PreferenceStore;
pub use util::{pretty_print_dictionary, pretty_print_plist};

use std::io::{self, BufWriter};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// A trait combining all required characteristics for a device communication
/// socket.
///
/// Tokio's `TcpStream` and `UnixStream` implement this trait, as does the TLS
/// stream the connection is upgraded to mid-session.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// A property-list channel to one device service.
///
/// Frames are a 4-byte big-endian length followed by an XML property list.
/// The same framing is used in both modes; when a TLS session is active the
/// frames ride the TLS stream instead of the raw socket. Exactly one request
/// may be in flight at a time, which `&mut self` enforces.
pub struct PlistService {
    socket: Option<Box<dyn ReadWrite>>,
    tls: Option<TlsStream<Box<dyn ReadWrite>>>,
    label: Option<String>,
    timeout: Option<Duration>,
}

impl PlistService {
    /// Wraps an established connection to a device port.
    ///
    /// The label, when non-empty, is echoed as the `Label` key of every
    /// outbound request. It is usually the program name.
    pub fn new(socket: Box<dyn ReadWrite>, label: Option<String>) -> Self {
        Self {
            socket: Some(socket),
            tls: None,
            label,
            timeout: None,
        }
    }

    /// The label echoed in outbound requests, if one is configured.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref().filter(|l| !l.is_empty())
    }

    /// Replaces or clears the request label.
    pub fn set_label(&mut self, label: Option<String>) {
        self.label = label;
    }

    /// Bounds every subsequent read. `None` (the default) blocks until the
    /// device answers or the connection dies.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Whether traffic is currently TLS-protected.
    pub fn is_encrypted(&self) -> bool {
        self.tls.is_some()
    }

    fn stream(&mut self) -> Result<&mut dyn ReadWrite, LockdownError> {
        if let Some(tls) = self.tls.as_mut() {
            return Ok(tls);
        }
        match self.socket.as_mut() {
            Some(socket) => Ok(&mut **socket),
            None => Err(LockdownError::NoEstablishedConnection),
        }
    }

    /// Sends one property-list message to the device.
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), LockdownError> {
        debug!("sending plist: {}", pretty_print_plist(&message));

        let mut writer = BufWriter::new(Vec::new());
        message.to_writer_xml(&mut writer)?;
        let body = writer.into_inner().map_err(|e| e.into_error())?;

        let encrypted = self.is_encrypted();
        let stream = self.stream()?;
        let write = async {
            stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
            stream.write_all(&body).await?;
            stream.flush().await
        };
        write.await.map_err(|e| transport_error(e, encrypted))
    }

    /// Reads one property-list message from the device.
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, LockdownError> {
        let timeout = self.timeout;
        let fut = self.read_plist_inner();
        let response = match timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "device did not answer in time")
            })??,
            None => fut.await?,
        };
        debug!("received plist: {}", pretty_print_dictionary(&response));
        Ok(response)
    }

    async fn read_plist_inner(&mut self) -> Result<plist::Dictionary, LockdownError> {
        let encrypted = self.is_encrypted();
        let stream = self.stream()?;
        let read = async {
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).await?;
            let mut body = vec![0; u32::from_be_bytes(len) as usize];
            stream.read_exact(&mut body).await?;
            Ok::<_, io::Error>(body)
        };
        let body = read.await.map_err(|e| transport_error(e, encrypted))?;
        Ok(plist::from_bytes(&body)?)
    }

    /// Runs the TLS client handshake on the underlying socket. All traffic
    /// after a successful return is TLS-framed.
    pub(crate) async fn enable_tls(
        &mut self,
        config: Arc<rustls::ClientConfig>,
    ) -> Result<(), LockdownError> {
        let socket = self
            .socket
            .take()
            .ok_or(LockdownError::NoEstablishedConnection)?;
        let connector = TlsConnector::from(config);
        let tls = connector
            .connect(ServerName::try_from("Device").unwrap(), socket)
            .await
            .map_err(tls_io_error)?;
        self.tls = Some(tls);
        Ok(())
    }

    /// Sends a TLS close notification and drops back to the plain socket.
    /// A no-op when no TLS session is active.
    pub(crate) async fn disable_tls(&mut self) {
        if let Some(mut tls) = self.tls.take() {
            let (_, conn) = tls.get_mut();
            conn.send_close_notify();
            // flush writes the pending close_notify record without shutting
            // down the socket underneath
            if let Err(e) = tls.flush().await {
                debug!("close notify not delivered: {e}");
            }
            let (socket, _) = tls.into_inner();
            self.socket = Some(socket);
        }
    }
}

impl std::fmt::Debug for PlistService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlistService")
            .field("label", &self.label)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

/// rustls reports both handshake and record-layer failures as `io::Error`
/// with the TLS-level cause attached; unwrap it so it surfaces as a TLS
/// failure rather than a transport one.
fn tls_io_error(e: io::Error) -> LockdownError {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        Some(tls) => LockdownError::Ssl(tls.clone()),
        None => LockdownError::Mux(e),
    }
}

/// Maps an I/O failure on the active channel. While a TLS session is up,
/// every send/recv goes through it, so its errors are classified as TLS
/// errors.
fn transport_error(e: io::Error, encrypted: bool) -> LockdownError {
    if encrypted {
        tls_io_error(e)
    } else {
        LockdownError::Mux(e)
    }
}

/// Everything a lockdown exchange can fail with.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LockdownError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("mux transport failed")]
    Mux(#[from] io::Error),
    #[error("property list encode/decode failed")]
    Plist(#[from] plist::Error),
    #[error("response was not a conforming reply to the request")]
    PlistError,
    #[error("response missing required field `{0}`")]
    NotEnoughData(&'static str),
    #[error("device rejected pairing: {0:?}")]
    PairingFailed(String),
    #[error("device is locked with a passcode")]
    PasswordProtected,
    #[error("device does not trust this host")]
    InvalidHostID,
    #[error("operation requires an open session")]
    NoRunningSession,
    #[error("device could not start the service")]
    StartServiceFailed,
    #[error("device rejected the activation record")]
    ActivationFailed,
    #[error("host preference store is missing required material")]
    InvalidConfiguration,
    #[error("TLS session failed")]
    Ssl(#[from] rustls::Error),
    #[error("PEM parse failed")]
    PemParse(#[from] rustls::pki_types::pem::Error),
    #[error("crypto operation failed: {0}")]
    Crypto(String),
    #[error("unexpected response from the device")]
    UnexpectedResponse,
    #[error("unknown error `{0}` returned from the device")]
    UnknownErrorType(String),
}

impl LockdownError {
    /// Maps a device-reported error string to a typed error. Unmapped strings
    /// are kept verbatim by the callers for diagnostics.
    pub(crate) fn from_device_error(e: &str) -> Option<Self> {
        match e {
            "PasswordProtected" => Some(Self::PasswordProtected),
            "InvalidHostID" => Some(Self::InvalidHostID),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::OnceLock;

    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs8::LineEnding;

    use crate::prefs::PreferenceStore;

    static STORE: OnceLock<(tempfile::TempDir, PreferenceStore)> = OnceLock::new();

    /// A provisioned preference store shared across the suite; host identity
    /// generation is expensive enough that each test should not repeat it.
    pub(crate) fn shared_store() -> &'static PreferenceStore {
        let (_, store) = STORE.get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            let store = PreferenceStore::new(dir.path());
            store.identity().unwrap();
            (dir, store)
        });
        store
    }

    static DEVICE_KEY: OnceLock<String> = OnceLock::new();

    /// A PKCS#1 PEM public key standing in for a device's `DevicePublicKey`.
    pub(crate) fn device_public_key_pem() -> &'static str {
        DEVICE_KEY.get_or_init(|| {
            let mut rng = rand_core::OsRng;
            let key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
            key.to_public_key()
                .to_pkcs1_pem(LineEnding::LF)
                .unwrap()
        })
    }
}
