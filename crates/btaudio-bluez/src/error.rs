//! Mapping from BlueZ errors to the daemon's discriminated kinds.

use btaudio_core::{Address, Error};

/// Translate a `bluer::Error` raised while operating on `address`.
///
/// BlueZ reports some conditions only through the message text
/// ("Page Timeout" arrives as a generic `Failed`), so both the kind and
/// the message are consulted.
pub fn map_bluez_error(address: &Address, err: bluer::Error) -> Error {
    use bluer::ErrorKind;

    let message = err.message.clone();
    let lower = message.to_ascii_lowercase();
    if lower.contains("page timeout") {
        return Error::DeviceUnreachable {
            address: address.to_string(),
            detail: message,
        };
    }
    match err.kind {
        ErrorKind::AuthenticationFailed
        | ErrorKind::AuthenticationRejected
        | ErrorKind::AuthenticationCanceled
        | ErrorKind::AuthenticationTimeout => Error::AuthRejected {
            address: address.to_string(),
            detail: message,
        },
        ErrorKind::InProgress => Error::Busy {
            address: address.to_string(),
        },
        ErrorKind::AlreadyExists => Error::AlreadyPaired {
            address: address.to_string(),
        },
        _ => {
            if lower.contains("already paired") {
                Error::AlreadyPaired {
                    address: address.to_string(),
                }
            } else {
                Error::BluezUnknown(format!("{address}: {message}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btaudio_core::ErrorKind as Kind;

    fn addr() -> Address {
        Address::parse("AA:BB:CC:DD:EE:01").unwrap()
    }

    fn bluez_err(kind: bluer::ErrorKind, message: &str) -> bluer::Error {
        bluer::Error {
            kind,
            message: message.into(),
        }
    }

    #[test]
    fn page_timeout_is_unreachable() {
        let err = map_bluez_error(&addr(), bluez_err(bluer::ErrorKind::Failed, "Page Timeout"));
        assert_eq!(err.kind(), Kind::DeviceUnreachable);
    }

    #[test]
    fn auth_failures_map_to_rejected() {
        for kind in [
            bluer::ErrorKind::AuthenticationFailed,
            bluer::ErrorKind::AuthenticationRejected,
        ] {
            let err = map_bluez_error(&addr(), bluez_err(kind, "Authentication Failed"));
            assert_eq!(err.kind(), Kind::AuthRejected);
        }
    }

    #[test]
    fn in_progress_is_busy() {
        let err = map_bluez_error(
            &addr(),
            bluez_err(bluer::ErrorKind::InProgress, "In Progress"),
        );
        assert_eq!(err.kind(), Kind::Busy);
    }

    #[test]
    fn already_exists_is_already_paired() {
        let err = map_bluez_error(
            &addr(),
            bluez_err(bluer::ErrorKind::AlreadyExists, "Already Exists"),
        );
        assert_eq!(err.kind(), Kind::AlreadyPaired);
    }

    #[test]
    fn unknown_errors_keep_detail() {
        let err = map_bluez_error(
            &addr(),
            bluez_err(bluer::ErrorKind::NotReady, "Resource Not Ready"),
        );
        assert_eq!(err.kind(), Kind::BluezUnknown);
        assert!(err.to_string().contains("Resource Not Ready"));
    }
}
