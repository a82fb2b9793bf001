use crate::config::{parse_port_list, ParamKey};
use crate::error::InvokeError;
use crate::net::UnifyAddr;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Immutable descriptor of a remote endpoint.
///
/// URI form: `transport://host:port[/path]/?key1=val1&key2=val2`.
/// Parsed once; equality is structural on transport+host+port+path+params,
/// so a locator can key the invoker registry. Parameters are kept sorted
/// (BTreeMap), which makes re-serialization deterministic: parse → display
/// → parse is identity up to parameter order.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub path: Option<String>,
    pub params: BTreeMap<String, String>,
}

impl Locator {
    pub fn new(transport: &str, host: &str, port: u16) -> Self {
        Self {
            transport: transport.to_string(),
            host: host.to_string(),
            port,
            path: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: ParamKey, value: &str) -> Self {
        self.params.insert(key.as_ref().to_string(), value.to_string());
        self
    }

    #[inline]
    pub fn param(&self, key: ParamKey) -> Option<&str> {
        self.params.get(key.as_ref()).map(|s| s.as_str())
    }

    /// Secondary endpoints advertised by this locator, in parameter order
    pub fn secondary_hosts(&self) -> Result<Vec<(String, u16)>, InvokeError> {
        match self.param(ParamKey::SecondaryConnectPorts) {
            None => Ok(Vec::new()),
            Some(s) => {
                let ports = parse_port_list(ParamKey::SecondaryConnectPorts, s)?;
                Ok(ports.into_iter().map(|p| (self.host.clone(), p)).collect())
            }
        }
    }

    /// The primary bind/connect address
    pub fn to_addr(&self) -> Result<UnifyAddr, InvokeError> {
        if self.transport == "unix" {
            match self.path.as_ref() {
                Some(p) => Ok(UnifyAddr::Path(p.into())),
                None => Err(InvokeError::config("unix locator without a socket path")),
            }
        } else {
            let s = format!("{}:{}", self.host, self.port);
            UnifyAddr::from_str(&s)
                .map_err(|_| InvokeError::config(format!("cannot resolve {:?}", s)))
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}:{}", self.transport, self.host, self.port)?;
        if let Some(p) = self.path.as_ref() {
            write!(f, "{}", p)?;
        }
        if !self.params.is_empty() {
            write!(f, "/?")?;
            let mut first = true;
            for (k, v) in &self.params {
                if !first {
                    write!(f, "&")?;
                }
                write!(f, "{}={}", k, v)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Locator {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Locator {
    type Err = InvokeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || InvokeError::config(format!("malformed locator {:?}", s));
        let (transport, rest) = s.split_once("://").ok_or_else(bad)?;
        if transport.is_empty() {
            return Err(bad());
        }

        let (authority_and_path, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };

        let (authority, path) = match authority_and_path.split_once('/') {
            Some((a, p)) => {
                let p = p.trim_end_matches('/');
                (a, if p.is_empty() { None } else { Some(format!("/{}", p)) })
            }
            None => (authority_and_path, None),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port = p.parse::<u16>().map_err(|_| bad())?;
                (h.to_string(), port)
            }
            None => {
                if transport == "unix" {
                    (authority.to_string(), 0)
                } else {
                    return Err(bad());
                }
            }
        };

        let mut params = BTreeMap::new();
        if let Some(q) = query {
            for pair in q.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (k, v) = pair.split_once('=').ok_or_else(bad)?;
                if k.is_empty() {
                    return Err(bad());
                }
                params.insert(k.to_string(), v.to_string());
            }
        }

        Ok(Self { transport: transport.to_string(), host, port, path, params })
    }
}
