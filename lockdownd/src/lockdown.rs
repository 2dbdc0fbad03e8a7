//! Lockdown service client.
//!
//! Lockdown is the device's front door: every other device service is
//! reached by asking lockdown to start it. A full-trust client runs the
//! handshake (`QueryType`, pairing as needed, `ValidatePair`,
//! `StartSession` with the optional TLS upgrade) and then issues operations
//! on the resulting session.

use std::sync::Arc;

use log::{debug, warn};
use plist::{Dictionary, Value};

use crate::message::{self, ResultStatus};
use crate::prefs::PreferenceStore;
use crate::provider::DeviceProvider;
use crate::{LockdownError, PlistService, tls};

/// The well-known lockdown port (62078) on the multiplexed device bus.
pub const LOCKDOWN_PORT: u16 = 0xf27e;

/// What `QueryType` answers in normal mode.
pub const LOCKDOWN_SERVICE_TYPE: &str = "com.apple.mobile.lockdown";

/// Client for the lockdown service.
///
/// A handle owns one connection and speaks one request at a time. Handles
/// for different devices are independent; a single handle is not meant to be
/// shared across tasks.
pub struct LockdownClient {
    /// The underlying property-list channel.
    pub service: PlistService,
    session_id: Option<String>,
    udid: Option<String>,
    tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl LockdownClient {
    /// Wraps an established lockdown connection without any handshake.
    pub fn new(service: PlistService) -> Self {
        Self {
            service,
            session_id: None,
            udid: None,
            tls_config: None,
        }
    }

    /// Connects to the device's lockdown port.
    pub async fn connect(provider: &impl DeviceProvider) -> Result<Self, LockdownError> {
        let service = provider.connect(LOCKDOWN_PORT).await?;
        Ok(Self::new(service))
    }

    /// Connects and runs the full trust handshake, pairing first if this
    /// host has never seen the device.
    pub async fn connect_with_handshake(
        provider: &impl DeviceProvider,
        store: &PreferenceStore,
    ) -> Result<Self, LockdownError> {
        let mut client = Self::connect(provider).await?;
        client.handshake(store).await?;
        Ok(client)
    }

    /// Runs the trust handshake on an already connected client.
    pub async fn handshake(&mut self, store: &PreferenceStore) -> Result<(), LockdownError> {
        let service_type = self.query_type().await?;
        if service_type != LOCKDOWN_SERVICE_TYPE {
            warn!("QueryType returned {service_type:?}");
        }

        let udid = self.device_udid().await?;
        debug!("device udid: {udid}");

        let host_id = store.host_id()?;

        if !store.has_device_public_key(&udid) {
            self.pair(store, Some(&host_id)).await?;
        }

        // trusted-host status is granted per connection by ValidatePair
        self.validate_pair(store, Some(&host_id)).await?;

        self.start_session(store, &host_id).await?;
        Ok(())
    }

    /// The label echoed in requests, if any.
    pub fn label(&self) -> Option<&str> {
        self.service.label()
    }

    /// Replaces or clears the request label.
    pub fn set_label(&mut self, label: Option<String>) {
        self.service.set_label(label);
    }

    /// The id of the open session, if one is open.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub(crate) fn request(&self, verb: &str) -> Dictionary {
        message::request(verb, self.service.label())
    }

    fn response_error(response: &Dictionary) -> LockdownError {
        match message::error_string(response) {
            Some(e) => LockdownError::from_device_error(e)
                .unwrap_or_else(|| LockdownError::UnknownErrorType(e.to_owned())),
            None => LockdownError::UnexpectedResponse,
        }
    }

    async fn round_trip(&mut self, request: Dictionary) -> Result<Dictionary, LockdownError> {
        self.service.send_plist(Value::Dictionary(request)).await?;
        self.service.read_plist().await
    }

    /// Queries the service type; `com.apple.mobile.lockdown` in normal mode,
    /// something else in recovery or restore.
    pub async fn query_type(&mut self) -> Result<String, LockdownError> {
        let request = self.request("QueryType");
        let response = self.round_trip(request).await?;
        match message::check_result(&response, "QueryType") {
            ResultStatus::Success => message::expect_string(&response, "Type"),
            ResultStatus::Failure => Err(Self::response_error(&response)),
            ResultStatus::Malformed => Err(LockdownError::PlistError),
        }
    }

    /// Retrieves a value. Both arguments are optional: no domain means the
    /// global domain, no key returns the whole domain dictionary.
    pub async fn get_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<Value, LockdownError> {
        let mut request = self.request("GetValue");
        if let Some(domain) = domain {
            request.insert("Domain".into(), domain.into());
        }
        if let Some(key) = key {
            request.insert("Key".into(), key.into());
        }

        let response = self.round_trip(request).await?;
        match message::check_result(&response, "GetValue") {
            ResultStatus::Success => response
                .get("Value")
                .cloned()
                .ok_or(LockdownError::NotEnoughData("Value")),
            ResultStatus::Failure => Err(Self::response_error(&response)),
            ResultStatus::Malformed => Err(LockdownError::PlistError),
        }
    }

    /// Sets a value under an optional domain and key.
    pub async fn set_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
        value: Value,
    ) -> Result<(), LockdownError> {
        let mut request = self.request("SetValue");
        if let Some(domain) = domain {
            request.insert("Domain".into(), domain.into());
        }
        if let Some(key) = key {
            request.insert("Key".into(), key.into());
        }
        request.insert("Value".into(), value);

        let response = self.round_trip(request).await?;
        match message::check_result(&response, "SetValue") {
            ResultStatus::Success => Ok(()),
            ResultStatus::Failure => Err(Self::response_error(&response)),
            ResultStatus::Malformed => Err(LockdownError::PlistError),
        }
    }

    /// Removes a value. Removing vital keys can leave the device in a bad
    /// state; lockdown does not second-guess the request.
    pub async fn remove_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<(), LockdownError> {
        let mut request = self.request("RemoveValue");
        if let Some(domain) = domain {
            request.insert("Domain".into(), domain.into());
        }
        if let Some(key) = key {
            request.insert("Key".into(), key.into());
        }

        let response = self.round_trip(request).await?;
        match message::check_result(&response, "RemoveValue") {
            ResultStatus::Success => Ok(()),
            ResultStatus::Failure => Err(Self::response_error(&response)),
            ResultStatus::Malformed => Err(LockdownError::PlistError),
        }
    }

    /// The device's unique identifier, fetched once and cached.
    pub async fn device_udid(&mut self) -> Result<String, LockdownError> {
        if let Some(udid) = &self.udid {
            return Ok(udid.clone());
        }
        let value = self.get_value(None, Some("UniqueDeviceID")).await?;
        let udid = value
            .as_string()
            .ok_or(LockdownError::NotEnoughData("UniqueDeviceID"))?
            .to_owned();
        self.udid = Some(udid.clone());
        Ok(udid)
    }

    /// The user-visible device name.
    pub async fn get_device_name(&mut self) -> Result<String, LockdownError> {
        let value = self.get_value(None, Some("DeviceName")).await?;
        value
            .as_string()
            .map(str::to_owned)
            .ok_or(LockdownError::NotEnoughData("DeviceName"))
    }

    /// Opens a session for the given HostID, upgrading the connection to TLS
    /// when the device asks for it. Any session already open on this handle
    /// is stopped first.
    ///
    /// Returns the session id and whether the session is TLS-protected.
    /// `InvalidHostID` means the device no longer trusts this host and the
    /// caller should re-pair.
    pub async fn start_session(
        &mut self,
        store: &PreferenceStore,
        host_id: &str,
    ) -> Result<(String, bool), LockdownError> {
        if host_id.is_empty() {
            return Err(LockdownError::InvalidArgument);
        }

        if self.session_id.is_some() {
            if let Err(e) = self.stop_session().await {
                warn!("could not stop previous session: {e}");
            }
        }

        let mut request = self.request("StartSession");
        request.insert("HostID".into(), host_id.into());

        let response = self.round_trip(request).await?;
        match message::check_result(&response, "StartSession") {
            ResultStatus::Success => {}
            ResultStatus::Failure => return Err(Self::response_error(&response)),
            ResultStatus::Malformed => return Err(LockdownError::PlistError),
        }

        let session_id = message::expect_string(&response, "SessionID")?;
        let ssl = response
            .get("EnableSessionSSL")
            .and_then(Value::as_boolean)
            .unwrap_or(false);
        debug!("session {session_id} started, ssl: {ssl}");
        self.session_id = Some(session_id.clone());

        if ssl {
            let config = match &self.tls_config {
                Some(config) => config.clone(),
                None => {
                    let config = Arc::new(tls::client_config(&store.identity()?)?);
                    self.tls_config = Some(config.clone());
                    config
                }
            };
            if let Err(e) = self.service.enable_tls(config).await {
                // the channel is gone; the session never became usable
                self.session_id = None;
                return Err(e);
            }
        }

        Ok((session_id, ssl))
    }

    /// Stops the open session. Local state is released whatever the device
    /// answers: TLS is shut down and the session id cleared.
    pub async fn stop_session(&mut self) -> Result<(), LockdownError> {
        let result = self.stop_session_request().await;
        self.service.disable_tls().await;
        self.session_id = None;
        result
    }

    async fn stop_session_request(&mut self) -> Result<(), LockdownError> {
        let session_id = self
            .session_id
            .clone()
            .ok_or(LockdownError::NoRunningSession)?;

        debug!("stopping session {session_id}");
        let mut request = self.request("StopSession");
        request.insert("SessionID".into(), session_id.into());

        let response = self.round_trip(request).await?;
        match message::check_result(&response, "StopSession") {
            ResultStatus::Success => Ok(()),
            ResultStatus::Failure => Err(Self::response_error(&response)),
            ResultStatus::Malformed => Err(LockdownError::PlistError),
        }
    }

    /// Asks lockdown to start a service. Requires an open session; returns
    /// the port the service listens on.
    pub async fn start_service(
        &mut self,
        store: &PreferenceStore,
        service_name: &str,
    ) -> Result<u16, LockdownError> {
        if service_name.is_empty() {
            return Err(LockdownError::InvalidArgument);
        }
        store.host_id()?;
        if self.session_id.is_none() {
            return Err(LockdownError::NoRunningSession);
        }

        let mut request = self.request("StartService");
        request.insert("Service".into(), service_name.into());

        let response = self.round_trip(request).await?;
        match message::check_result(&response, "StartService") {
            ResultStatus::Success => match response
                .get("Port")
                .and_then(Value::as_unsigned_integer)
            {
                Some(port) if port > 0 => {
                    u16::try_from(port).map_err(|_| LockdownError::UnexpectedResponse)
                }
                Some(_) => Err(LockdownError::UnexpectedResponse),
                None => Err(LockdownError::NotEnoughData("Port")),
            },
            ResultStatus::Failure => {
                let raw = message::error_string(&response).unwrap_or_default();
                warn!("StartService {service_name:?} failed: {raw:?}");
                Err(LockdownError::StartServiceFailed)
            }
            ResultStatus::Malformed => Err(LockdownError::PlistError),
        }
    }

    /// Activates the device with a record obtained from the activation
    /// webservice. Requires an open session.
    pub async fn activate(&mut self, activation_record: Value) -> Result<(), LockdownError> {
        if self.session_id.is_none() {
            return Err(LockdownError::NoRunningSession);
        }

        let mut request = self.request("Activate");
        request.insert("ActivationRecord".into(), activation_record);

        let response = self.round_trip(request).await?;
        match message::check_result(&response, "Activate") {
            ResultStatus::Success => Ok(()),
            ResultStatus::Failure => {
                let raw = message::error_string(&response).unwrap_or_default();
                warn!("activation failed: {raw:?}");
                Err(LockdownError::ActivationFailed)
            }
            ResultStatus::Malformed => Err(LockdownError::PlistError),
        }
    }

    /// Deactivates the device, returning it to the activation screen.
    /// Requires an open session.
    pub async fn deactivate(&mut self) -> Result<(), LockdownError> {
        if self.session_id.is_none() {
            return Err(LockdownError::NoRunningSession);
        }

        let request = self.request("Deactivate");
        let response = self.round_trip(request).await?;
        match message::check_result(&response, "Deactivate") {
            ResultStatus::Success => Ok(()),
            ResultStatus::Failure => Err(Self::response_error(&response)),
            ResultStatus::Malformed => Err(LockdownError::PlistError),
        }
    }

    /// Tells the device to reboot into recovery mode immediately.
    pub async fn enter_recovery(&mut self) -> Result<(), LockdownError> {
        let request = self.request("EnterRecovery");
        let response = self.round_trip(request).await?;
        match message::check_result(&response, "EnterRecovery") {
            ResultStatus::Success => Ok(()),
            ResultStatus::Failure => Err(Self::response_error(&response)),
            ResultStatus::Malformed => Err(LockdownError::PlistError),
        }
    }

    /// Tells the device the conversation is over.
    pub async fn goodbye(&mut self) -> Result<(), LockdownError> {
        let request = self.request("Goodbye");
        let response = self.round_trip(request).await?;
        match message::check_result(&response, "Goodbye") {
            ResultStatus::Success => Ok(()),
            ResultStatus::Failure => Err(Self::response_error(&response)),
            ResultStatus::Malformed => Err(LockdownError::PlistError),
        }
    }

    /// Clean teardown: `StopSession`, then `Goodbye` (both still ride the TLS
    /// session when one is up), then the TLS close notification, then the
    /// transport is dropped. Failures along the way are logged and swallowed;
    /// resources are released regardless.
    pub async fn close(mut self) {
        if self.session_id.is_some() {
            if let Err(e) = self.stop_session_request().await {
                warn!("StopSession during teardown failed: {e}");
            }
            self.session_id = None;
        }
        if let Err(e) = self.goodbye().await {
            warn!("Goodbye during teardown failed: {e}");
        }
        self.service.disable_tls().await;
    }
}

impl From<PlistService> for LockdownClient {
    fn from(service: PlistService) -> Self {
        Self::new(service)
    }
}
