//! Download policy resolution (§4.I "Download policy"), grounded on the
//! original project's `service/emby/download.go`.

use crate::config::DownloadStrategy;

/// What a download request should do, resolved from [`DownloadStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadDecision {
    /// Resolve via the drive and redirect, same as streaming.
    ResolveDirect,
    /// Reject with 403.
    Forbidden,
    /// Proxy the download to upstream Emby unchanged.
    ProxyOrigin,
}

pub fn resolve_download_decision(strategy: DownloadStrategy) -> DownloadDecision {
    match strategy {
        DownloadStrategy::Direct => DownloadDecision::ResolveDirect,
        DownloadStrategy::Forbidden => DownloadDecision::Forbidden,
        DownloadStrategy::Origin => DownloadDecision::ProxyOrigin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_strategy_resolves_via_drive() {
        assert_eq!(resolve_download_decision(DownloadStrategy::Direct), DownloadDecision::ResolveDirect);
    }

    #[test]
    fn forbidden_strategy_rejects() {
        assert_eq!(resolve_download_decision(DownloadStrategy::Forbidden), DownloadDecision::Forbidden);
    }

    #[test]
    fn origin_strategy_proxies_unchanged() {
        assert_eq!(resolve_download_decision(DownloadStrategy::Origin), DownloadDecision::ProxyOrigin);
    }
}
