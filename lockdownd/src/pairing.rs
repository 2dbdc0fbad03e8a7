//! Pair / ValidatePair / Unpair.
//!
//! All three verbs are the same exchange: fetch the device's public key,
//! mint certificates for it, send the pair record, then update the host's
//! record of the device. `Pair` delivers the record for the first time,
//! `ValidatePair` is what actually grants trusted-host status for the running
//! connection, and `Unpair` revokes the relationship on both ends.

use log::{debug, warn};
use plist::{Dictionary, Value};

use crate::lockdown::LockdownClient;
use crate::message::{self, ResultStatus};
use crate::prefs::PreferenceStore;
use crate::{LockdownError, ca};

/// The three pairing exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingVerb {
    Pair,
    ValidatePair,
    Unpair,
}

impl PairingVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            PairingVerb::Pair => "Pair",
            PairingVerb::ValidatePair => "ValidatePair",
            PairingVerb::Unpair => "Unpair",
        }
    }
}

impl std::fmt::Display for PairingVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LockdownClient {
    /// Delivers a freshly minted pair record to the device.
    ///
    /// A passcode-locked device rejects the first pairing with
    /// [`LockdownError::PasswordProtected`]; retry after the user unlocks.
    /// `host_id` overrides the stored HostID when given.
    pub async fn pair(
        &mut self,
        store: &PreferenceStore,
        host_id: Option<&str>,
    ) -> Result<(), LockdownError> {
        self.do_pair(store, host_id, PairingVerb::Pair).await
    }

    /// Validates an existing pairing, granting this connection trusted-host
    /// status. A device that does not know the host answers with failure;
    /// callers typically fall back to [`pair`](Self::pair).
    pub async fn validate_pair(
        &mut self,
        store: &PreferenceStore,
        host_id: Option<&str>,
    ) -> Result<(), LockdownError> {
        self.do_pair(store, host_id, PairingVerb::ValidatePair).await
    }

    /// Revokes the pairing and forgets the device's public key.
    pub async fn unpair(
        &mut self,
        store: &PreferenceStore,
        host_id: Option<&str>,
    ) -> Result<(), LockdownError> {
        self.do_pair(store, host_id, PairingVerb::Unpair).await
    }

    /// Fetches the device's RSA public key. Normally a `data` node holding
    /// PEM text, but some firmware returns it as a plain string.
    pub async fn get_device_public_key(&mut self) -> Result<Vec<u8>, LockdownError> {
        let value = self.get_value(None, Some("DevicePublicKey")).await?;
        match value {
            Value::Data(data) => Ok(data),
            Value::String(text) => Ok(text.into_bytes()),
            _ => Err(LockdownError::UnexpectedResponse),
        }
    }

    async fn do_pair(
        &mut self,
        store: &PreferenceStore,
        host_id: Option<&str>,
        verb: PairingVerb,
    ) -> Result<(), LockdownError> {
        let public_key = self.get_device_public_key().await?;
        let certs = ca::generate_pair_certificates(&public_key, store)?;
        let host_id = match host_id {
            Some(host_id) => host_id.to_owned(),
            None => store.host_id()?,
        };
        let udid = self.device_udid().await?;

        let mut record = Dictionary::new();
        record.insert(
            "DeviceCertificate".into(),
            Value::Data(certs.device_cert_pem),
        );
        record.insert("HostCertificate".into(), Value::Data(certs.host_cert_pem));
        record.insert("HostID".into(), host_id.into());
        record.insert("RootCertificate".into(), Value::Data(certs.root_cert_pem));

        let mut request = self.request(verb.as_str());
        request.insert("PairRecord".into(), Value::Dictionary(record));

        self.service.send_plist(Value::Dictionary(request)).await?;
        let response = self.service.read_plist().await?;

        match message::check_result(&response, verb.as_str()) {
            ResultStatus::Success => {
                debug!("{verb} success");
                if verb == PairingVerb::Unpair {
                    store.remove_device_public_key(&udid)?;
                } else {
                    store.set_device_public_key(&udid, &public_key)?;
                }
                Ok(())
            }
            ResultStatus::Failure => {
                let raw = message::error_string(&response).unwrap_or_default();
                warn!("{verb} rejected by device: {raw:?}");
                match LockdownError::from_device_error(raw) {
                    Some(e @ LockdownError::PasswordProtected) => Err(e),
                    _ => Err(LockdownError::PairingFailed(raw.to_owned())),
                }
            }
            ResultStatus::Malformed => Err(LockdownError::PlistError),
        }
    }
}

#[cfg(test)]
mod tests {
    use plist::Value;

    use super::*;
    use crate::lockdown::tests::{
        client_pair, fail_response, ok_response, read_request, send_response, value_response,
    };
    use crate::test_util;

    #[tokio::test]
    async fn cold_pair_stores_the_device_key() {
        let store = test_util::shared_store();
        let udid = "PAIR-COLD-UDID";
        let key_pem = test_util::device_public_key_pem();

        let (mut client, mut device) = client_pair();
        let device_task = tokio::spawn(async move {
            let req = read_request(&mut device).await;
            assert_eq!(req.get("Key").and_then(Value::as_string), Some("DevicePublicKey"));
            send_response(
                &mut device,
                value_response("GetValue", Value::Data(key_pem.as_bytes().to_vec())),
            )
            .await;

            let req = read_request(&mut device).await;
            assert_eq!(req.get("Key").and_then(Value::as_string), Some("UniqueDeviceID"));
            send_response(&mut device, value_response("GetValue", udid.into())).await;

            let req = read_request(&mut device).await;
            assert_eq!(req.get("Request").and_then(Value::as_string), Some("Pair"));
            let record = req
                .get("PairRecord")
                .and_then(Value::as_dictionary)
                .expect("pair record missing");
            for key in [
                "DeviceCertificate",
                "HostCertificate",
                "HostID",
                "RootCertificate",
            ] {
                assert!(record.contains_key(key), "missing {key}");
            }
            assert!(
                record
                    .get("DeviceCertificate")
                    .and_then(Value::as_data)
                    .unwrap()
                    .starts_with(b"-----BEGIN CERTIFICATE-----")
            );
            send_response(&mut device, ok_response("Pair")).await;
        });

        client.pair(store, None).await.unwrap();
        device_task.await.unwrap();

        assert!(store.has_device_public_key(udid));
        store.remove_device_public_key(udid).unwrap();
    }

    #[tokio::test]
    async fn locked_device_reports_password_protected() {
        let store = test_util::shared_store();
        let udid = "PAIR-LOCKED-UDID";
        let key_pem = test_util::device_public_key_pem();

        let (mut client, mut device) = client_pair();
        let device_task = tokio::spawn(async move {
            read_request(&mut device).await;
            send_response(
                &mut device,
                value_response("GetValue", Value::Data(key_pem.as_bytes().to_vec())),
            )
            .await;
            read_request(&mut device).await;
            send_response(&mut device, value_response("GetValue", udid.into())).await;
            read_request(&mut device).await;
            send_response(&mut device, fail_response("Pair", Some("PasswordProtected"))).await;
        });

        match client.pair(store, None).await {
            Err(LockdownError::PasswordProtected) => {}
            other => panic!("unexpected: {other:?}"),
        }
        device_task.await.unwrap();

        // no pair record was written
        assert!(!store.has_device_public_key(udid));
    }

    #[tokio::test]
    async fn validate_against_unknown_host_is_pairing_failed() {
        let store = test_util::shared_store();
        let key_pem = test_util::device_public_key_pem();

        let (mut client, mut device) = client_pair();
        let device_task = tokio::spawn(async move {
            read_request(&mut device).await;
            send_response(
                &mut device,
                value_response("GetValue", Value::Data(key_pem.as_bytes().to_vec())),
            )
            .await;
            read_request(&mut device).await;
            send_response(&mut device, value_response("GetValue", "PAIR-STALE-UDID".into()))
                .await;
            read_request(&mut device).await;
            send_response(&mut device, fail_response("ValidatePair", None)).await;
        });

        match client.validate_pair(store, None).await {
            Err(LockdownError::PairingFailed(raw)) => assert!(raw.is_empty()),
            other => panic!("unexpected: {other:?}"),
        }
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn unpair_removes_the_stored_key() {
        let store = test_util::shared_store();
        let udid = "PAIR-UNPAIR-UDID";
        let key_pem = test_util::device_public_key_pem();
        store
            .set_device_public_key(udid, key_pem.as_bytes())
            .unwrap();

        let (mut client, mut device) = client_pair();
        let device_task = tokio::spawn(async move {
            read_request(&mut device).await;
            send_response(
                &mut device,
                value_response("GetValue", Value::Data(key_pem.as_bytes().to_vec())),
            )
            .await;
            read_request(&mut device).await;
            send_response(&mut device, value_response("GetValue", udid.into())).await;
            let req = read_request(&mut device).await;
            assert_eq!(req.get("Request").and_then(Value::as_string), Some("Unpair"));
            send_response(&mut device, ok_response("Unpair")).await;
        });

        client.unpair(store, None).await.unwrap();
        device_task.await.unwrap();

        assert!(!store.has_device_public_key(udid));
    }

    #[test]
    fn verbs_render_to_wire_names() {
        assert_eq!(PairingVerb::Pair.as_str(), "Pair");
        assert_eq!(PairingVerb::ValidatePair.as_str(), "ValidatePair");
        assert_eq!(PairingVerb::Unpair.as_str(), "Unpair");
    }
}
