use std::time::Duration;

use log::{debug, warn};

use crate::error::RemoteFetchError;
use crate::routes::ROUTE_API_STATUS;
use crate::types::RemoteStatusRecord;

pub const PEER_TIMEOUT: Duration = Duration::from_secs(3);

pub fn peer_status_url(address: &str) -> String {
    format!("http://{}{}", address.trim(), ROUTE_API_STATUS)
}

pub fn decode_peer_status(body: &[u8]) -> Result<RemoteStatusRecord, RemoteFetchError> {
    let decode_error = |err: serde_json::Error| RemoteFetchError::Decode(err.to_string());
    let value: serde_json::Value = serde_json::from_slice(body).map_err(decode_error)?;
    if !value.is_object() {
        return Err(RemoteFetchError::Decode("expected a JSON object".into()));
    }
    serde_json::from_value(value).map_err(decode_error)
}

// Collapses a finished peer request into a record. Every failure kind
// yields the sentinel; nothing propagates to the caller.
pub fn resolve_peer_response(
    address: &str,
    outcome: Result<Vec<u8>, RemoteFetchError>,
) -> RemoteStatusRecord {
    match outcome.and_then(|body| decode_peer_status(&body)) {
        Ok(record) => {
            debug!("peer {address} door {}", record.state.as_str());
            record
        }
        Err(err) => {
            warn!("peer {address}: {err}");
            RemoteStatusRecord::sentinel()
        }
    }
}

pub trait PeerTransport {
    fn get(&mut self, url: &str, timeout: Duration) -> Result<Vec<u8>, RemoteFetchError>;
}

pub struct RemoteStatusClient<T> {
    transport: T,
    timeout: Duration,
}

impl<T: PeerTransport> RemoteStatusClient<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timeout(transport, PEER_TIMEOUT)
    }

    pub fn with_timeout(transport: T, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn fetch_peer(&mut self, address: &str) -> RemoteStatusRecord {
        let url = peer_status_url(address);
        let outcome = self.transport.get(&url, self.timeout);
        resolve_peer_response(address, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DoorState, Metric};
    use pretty_assertions::assert_eq;

    struct CannedTransport {
        reply: Result<Vec<u8>, RemoteFetchError>,
        requested: Vec<(String, Duration)>,
    }

    impl CannedTransport {
        fn new(reply: Result<Vec<u8>, RemoteFetchError>) -> Self {
            Self {
                reply,
                requested: Vec::new(),
            }
        }
    }

    impl PeerTransport for CannedTransport {
        fn get(&mut self, url: &str, timeout: Duration) -> Result<Vec<u8>, RemoteFetchError> {
            self.requested.push((url.to_string(), timeout));
            self.reply.clone()
        }
    }

    #[test]
    fn builds_status_url() {
        assert_eq!(
            peer_status_url(" 192.168.1.206 "),
            "http://192.168.1.206/api/status"
        );
    }

    #[test]
    fn decodes_well_formed_peer_reply() {
        let body = br#"{"state":"CLOSED","temperature":12.5,"RH":55.0,"HI":"--","type":"raw"}"#;
        let mut client = RemoteStatusClient::new(CannedTransport::new(Ok(body.to_vec())));

        let record = client.fetch_peer("10.0.0.7");

        assert_eq!(record.state, DoorState::Closed);
        assert_eq!(record.temperature, Metric::Value(12.5));
        assert_eq!(record.sensor_type, "raw");
        assert_eq!(
            client.transport.requested,
            vec![("http://10.0.0.7/api/status".to_string(), PEER_TIMEOUT)]
        );
    }

    #[test]
    fn odd_field_types_keep_the_rest_of_the_reply() {
        let record = resolve_peer_response(
            "10.0.0.7",
            Ok(br#"{"state":null,"temperature":12.5,"RH":40}"#.to_vec()),
        );
        assert_eq!(record.state, DoorState::Unknown);
        assert_eq!(record.temperature, Metric::Value(12.5));

        let record = resolve_peer_response(
            "10.0.0.7",
            Ok(br#"{"state":"OPEN","temperature":12.5,"type":3}"#.to_vec()),
        );
        assert_eq!(record.state, DoorState::Open);
        assert_eq!(record.temperature, Metric::Value(12.5));
        assert_eq!(record.sensor_type, "--");
    }

    #[test]
    fn every_failure_becomes_sentinel() {
        let failures = [
            Err(RemoteFetchError::Timeout),
            Err(RemoteFetchError::Transport("connection refused".into())),
            Err(RemoteFetchError::Status(500)),
            Ok(b"<html>oops</html>".to_vec()),
            Ok(b"[1,2,3]".to_vec()),
        ];

        for reply in failures {
            let mut client = RemoteStatusClient::new(CannedTransport::new(reply));
            assert_eq!(client.fetch_peer("10.0.0.7"), RemoteStatusRecord::sentinel());
        }
    }
}
