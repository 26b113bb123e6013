use crate::{error::PortalError, urlsplit::SplitUrl};

/// Checks that `remote` can be fetched. Never mutates the URL.
///
/// `inbound_query` is the query string of the proxy request, which is appended to the
/// suggested URL when the protocol is missing.
pub fn guard(remote: &SplitUrl, inbound_query: Option<&str>) -> Result<(), PortalError> {
    match remote.scheme.as_str() {
        "http" | "https" => {}
        "" => {
            let mut candidate = format!("https:{}", remote.geturl());
            if let Some(query) = inbound_query.filter(|q| !q.is_empty()) {
                candidate.push('?');
                candidate.push_str(query);
            }
            return Err(PortalError::MissingProtocol { candidate });
        }
        other => return Err(PortalError::UnsupportedScheme(other.to_string())),
    }
    if remote.netloc.is_empty() {
        return Err(PortalError::MissingDomain(remote.geturl()));
    }
    Ok(())
}
