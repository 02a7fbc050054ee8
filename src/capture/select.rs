use super::{CaptureBackend, CaptureDevice, CaptureError};

/// Picks the first device whose description contains `fragment`.
///
/// Matching is a case-sensitive substring test in the order the backend
/// enumerates devices.
pub fn select_device(
    backend: &dyn CaptureBackend,
    fragment: &str,
) -> Result<CaptureDevice, CaptureError> {
    let devices = backend.list_devices()?;

    tracing::debug!(
        backend = backend.name(),
        count = devices.len(),
        fragment,
        "enumerated capture devices"
    );

    devices
        .into_iter()
        .find(|d| d.description.contains(fragment))
        .ok_or_else(|| CaptureError::DeviceNotFound {
            fragment: fragment.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::replay::ReplayBackend;

    fn backend(devices: &[(&str, Option<&str>)]) -> ReplayBackend {
        ReplayBackend::new(
            devices
                .iter()
                .map(|(n, d)| CaptureDevice::new(*n, d.map(str::to_string)))
                .collect(),
        )
    }

    #[test]
    fn test_select_first_match_in_enumeration_order() {
        let backend = backend(&[
            ("lo", Some("Loopback")),
            ("eth0", Some("Intel Ethernet eth0")),
            ("eth1", Some("Intel Ethernet eth1")),
        ]);

        let dev = select_device(&backend, "Ethernet").expect("select");
        assert_eq!(dev.name, "eth0");
    }

    #[test]
    fn test_select_matches_name_when_description_missing() {
        let backend = backend(&[("lo", None), ("eth0", None)]);

        let dev = select_device(&backend, "eth0").expect("select");
        assert_eq!(dev.name, "eth0");
        assert_eq!(dev.description, "eth0");
    }

    #[test]
    fn test_select_is_case_sensitive() {
        let backend = backend(&[("eth0", Some("Intel Ethernet"))]);

        let err = select_device(&backend, "ethernet").expect_err("no match");
        assert_eq!(
            err,
            CaptureError::DeviceNotFound {
                fragment: "ethernet".to_string()
            }
        );
    }

    #[test]
    fn test_select_empty_device_list() {
        let backend = backend(&[]);
        assert!(matches!(
            select_device(&backend, "eth0"),
            Err(CaptureError::DeviceNotFound { .. })
        ));
    }
}
