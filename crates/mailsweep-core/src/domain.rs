//! Derivation of rule keys from raw email addresses.
//!
//! The default [`LabelCountParser`] treats the last two labels of a host as its
//! registrable domain. It does not consult a public-suffix list, so hosts under
//! multi-label suffixes such as `co.uk` resolve to the suffix itself
//! (`mail.example.co.uk` -> `co.uk`). Callers only depend on [`DomainParser`],
//! so a suffix-aware implementation can be swapped in without touching the rule
//! store or the classifier.

/// Domain and optional subdomain of a sender host, both lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderDomains {
    pub domain: String,
    /// Full hostname when it has labels beyond the primary domain.
    pub subdomain: Option<String>,
}

pub trait DomainParser: Send + Sync {
    /// Registrable domain of a hostname.
    fn primary_domain(&self, host: &str) -> String;

    fn has_subdomain(&self, host: &str) -> bool;

    /// Host part of an email address, lowercased.
    fn domain_of(&self, address: &str) -> Option<String> {
        let address = bare_address(address);
        let at = address.rfind('@')?;
        let host = normalize_host(&address[at + 1..]);
        if host.is_empty() { None } else { Some(host) }
    }

    fn sender_domains(&self, address: &str) -> Option<SenderDomains> {
        let host = self.domain_of(address)?;
        let domain = self.primary_domain(&host);
        let subdomain = if self.has_subdomain(&host) && host != domain {
            Some(host)
        } else {
            None
        };
        Some(SenderDomains { domain, subdomain })
    }
}

/// Dot-counting heuristic: fewer than two separators means the host is already
/// the primary domain, otherwise the last two labels are.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelCountParser;

impl DomainParser for LabelCountParser {
    fn primary_domain(&self, host: &str) -> String {
        let host = normalize_host(host);
        if host.matches('.').count() < 2 {
            return host;
        }
        let labels: Vec<&str> = host.rsplitn(3, '.').collect();
        format!("{}.{}", labels[1], labels[0])
    }

    fn has_subdomain(&self, host: &str) -> bool {
        normalize_host(host).matches('.').count() >= 2
    }
}

/// Lowercase an address and strip any display name (`Name <a@b.com>`).
pub fn normalize_address(address: &str) -> String {
    bare_address(address).to_lowercase()
}

fn bare_address(address: &str) -> &str {
    let trimmed = address.trim();
    match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if start < end => trimmed[start + 1..end].trim(),
        _ => trimmed,
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_domain_keeps_two_label_hosts() {
        let parser = LabelCountParser;
        assert_eq!(parser.primary_domain("icicibank.com"), "icicibank.com");
        assert_eq!(parser.primary_domain("localhost"), "localhost");
    }

    #[test]
    fn primary_domain_takes_last_two_labels() {
        let parser = LabelCountParser;
        assert_eq!(
            parser.primary_domain("custcomm.icicibank.com"),
            "icicibank.com"
        );
        assert_eq!(parser.primary_domain("a.b.c.Example.COM."), "example.com");
    }

    #[test]
    fn multi_label_suffixes_are_not_special_cased() {
        let parser = LabelCountParser;
        assert_eq!(parser.primary_domain("mail.example.co.uk"), "co.uk");
        assert!(parser.has_subdomain("example.co.uk"));
    }

    #[test]
    fn has_subdomain_counts_separators() {
        let parser = LabelCountParser;
        assert!(!parser.has_subdomain("bank.com"));
        assert!(parser.has_subdomain("alerts.bank.com"));
    }

    #[test]
    fn domain_of_lowercases_and_handles_display_names() {
        let parser = LabelCountParser;
        assert_eq!(
            parser.domain_of("X@Example.COM").as_deref(),
            Some("example.com")
        );
        assert_eq!(
            parser.domain_of("Bank Alerts <alerts@Mail.Bank.com>").as_deref(),
            Some("mail.bank.com")
        );
        assert_eq!(parser.domain_of("no-at-sign"), None);
        assert_eq!(parser.domain_of("trailing@"), None);
    }

    #[test]
    fn sender_domains_splits_subdomain() {
        let parser = LabelCountParser;
        let parts = parser
            .sender_domains("otp@custcomm.icicibank.com")
            .expect("domains");
        assert_eq!(parts.domain, "icicibank.com");
        assert_eq!(parts.subdomain.as_deref(), Some("custcomm.icicibank.com"));

        let flat = parser.sender_domains("ceo@bank.com").expect("domains");
        assert_eq!(flat.domain, "bank.com");
        assert_eq!(flat.subdomain, None);
    }

    #[test]
    fn normalize_address_strips_name() {
        assert_eq!(
            normalize_address(" CEO <CEO@Bank.com> "),
            "ceo@bank.com".to_string()
        );
    }
}
