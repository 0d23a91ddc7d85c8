use crate::provider::{IntrospectionProvider, ProviderError, ScanCriteria, ScanHandle};
use crate::weak_error;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("no active scan")]
    NoActiveScan,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

struct ScanSession {
    criteria: ScanCriteria,
    handle: ScanHandle,
    total: usize,
}

/// Page of results of the active scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPage {
    pub addresses: Vec<u64>,
    pub total: usize,
}

/// Holds at most one live value-scan result set between requests.
#[derive(Default)]
pub struct ScanManager {
    session: Option<ScanSession>,
}

impl ScanManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Criteria of the active scan.
    pub fn criteria(&self) -> Option<&ScanCriteria> {
        self.session.as_ref().map(|s| &s.criteria)
    }

    /// Start a new scan, the previous result set is released first.
    pub fn start(
        &mut self,
        provider: &mut dyn IntrospectionProvider,
        criteria: ScanCriteria,
    ) -> Result<usize, ScanError> {
        self.release(provider);

        let handle = provider.scan_value(&criteria)?;
        let total = match provider.enumerate_results(handle, 0) {
            Ok(results) => results.total,
            Err(e) => {
                weak_error!(provider.release_scan(handle), "release scan results:");
                return Err(e.into());
            }
        };

        self.session = Some(ScanSession {
            criteria,
            handle,
            total,
        });
        Ok(total)
    }

    pub fn fetch(
        &self,
        provider: &dyn IntrospectionProvider,
        max: usize,
    ) -> Result<ScanPage, ScanError> {
        let session = self.session.as_ref().ok_or(ScanError::NoActiveScan)?;
        let results = provider.enumerate_results(session.handle, max)?;
        Ok(ScanPage {
            addresses: results.addresses,
            total: session.total,
        })
    }

    /// Drop the active session, if any. Returns `true` if there was one.
    pub fn release(&mut self, provider: &mut dyn IntrospectionProvider) -> bool {
        match self.session.take() {
            Some(session) => {
                weak_error!(provider.release_scan(session.handle), "release scan results:");
                true
            }
            None => false,
        }
    }
}

/// Run a scan whose results never outlive the call.
pub fn one_shot<F>(
    provider: &mut dyn IntrospectionProvider,
    limit: usize,
    scan: F,
) -> Result<ScanPage, ScanError>
where
    F: FnOnce(&mut dyn IntrospectionProvider) -> Result<ScanHandle, ProviderError>,
{
    let handle = scan(&mut *provider)?;
    let results = provider.enumerate_results(handle, limit);
    weak_error!(provider.release_scan(handle), "release scan results:");
    let results = results?;
    Ok(ScanPage {
        addresses: results.addresses,
        total: results.total,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::{BytePattern, ProtectionFilter, ScanKind, ValueType};
    use crate::host::sim::SimulatedProvider;
    use std::str::FromStr;

    fn dword_criteria(value: u32) -> ScanCriteria {
        ScanCriteria {
            kind: ScanKind::Value {
                value_type: ValueType::Dword,
                bytes: value.to_le_bytes().to_vec(),
            },
            protection: ProtectionFilter::default(),
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let mut provider = SimulatedProvider::default_target();
        provider.write_bytes(0x500010, &1337u32.to_le_bytes()).unwrap();
        provider.write_bytes(0x500100, &1337u32.to_le_bytes()).unwrap();
        let mut scan = ScanManager::new();

        assert!(matches!(scan.fetch(&provider, 10), Err(ScanError::NoActiveScan)));

        assert_eq!(scan.start(&mut provider, dword_criteria(1337)).unwrap(), 2);
        let page = scan.fetch(&provider, 1).unwrap();
        assert_eq!(page.addresses, vec![0x500010]);
        assert_eq!(page.total, 2);
        assert_eq!(provider.live_scans(), 1);

        // a new scan replaces the previous result set
        scan.start(&mut provider, dword_criteria(7)).unwrap();
        assert_eq!(provider.live_scans(), 1);

        assert!(scan.release(&mut provider));
        assert!(!scan.release(&mut provider));
        assert_eq!(provider.live_scans(), 0);
    }

    #[test]
    fn test_one_shot_releases_handle() {
        let mut provider = SimulatedProvider::default_target();
        let pattern = BytePattern::from_str("48 89 ??").unwrap();
        let filter = ProtectionFilter::from_str("+X").unwrap();

        let page = one_shot(&mut provider, 100, |p| p.scan_pattern(&pattern, &filter)).unwrap();
        assert!(page.total >= 1);
        assert_eq!(provider.live_scans(), 0);
    }
}
