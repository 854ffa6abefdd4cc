use std::str::FromStr;

use crate::config::{split_list, ConfigError};

const DEFAULT_PORT: u16 = 9092;

/// `scheme://[principal@]host[:port][,host[:port]...]/[topic1,topic2,...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    pub scheme: String,
    pub principal: Option<String>,
    pub hosts: Vec<String>,
    pub topics: Vec<String>,
}

impl BrokerUrl {
    /// Comma separated `host:port` list for `bootstrap.servers`.
    pub fn bootstrap_servers(&self) -> String {
        self.hosts.join(",")
    }

    /// Consumer groups are namespaced by principal when one is present.
    pub fn group_id(&self, group: &str) -> String {
        match &self.principal {
            Some(principal) => format!("{principal}-{group}"),
            None => group.to_string(),
        }
    }
}

impl FromStr for BrokerUrl {
    type Err = ConfigError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidBrokerUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (principal, hosts) = match authority.rsplit_once('@') {
            Some((principal, hosts)) if !principal.is_empty() => {
                (Some(principal.to_string()), hosts)
            }
            Some(_) => return Err(invalid("empty principal")),
            None => (None, authority),
        };

        let hosts = split_list(hosts)
            .into_iter()
            .map(|host| match host.rsplit_once(':') {
                Some((name, port)) => {
                    if name.is_empty() || port.parse::<u16>().is_err() {
                        Err(invalid("bad host:port"))
                    } else {
                        Ok(host)
                    }
                }
                None => Ok(format!("{host}:{DEFAULT_PORT}")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if hosts.is_empty() {
            return Err(invalid("no hosts"));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            principal,
            hosts,
            topics: split_list(path),
        })
    }
}
