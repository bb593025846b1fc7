pub const DEFAULT_TOR_SOCKS_ADDR: &str = "127.0.0.1:9050";

#[derive(Clone, Debug)]
pub struct Config {
    /// SOCKS5 proxy address; `None` sends requests directly.
    pub socks_addr: Option<String>,
    pub timeout_secs: u64,
    pub verify_tls: bool,
    pub default_headers: Vec<(String, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socks_addr: None,
            timeout_secs: 60,
            verify_tls: true,
            default_headers: Vec::new(),
        }
    }
}

impl Config {
    pub fn tor() -> Self {
        Self::default().with_socks_addr(DEFAULT_TOR_SOCKS_ADDR)
    }

    pub fn with_socks_addr(mut self, addr: &str) -> Self {
        self.socks_addr = Some(addr.to_string());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.default_headers
            .push((name.to_string(), value.to_string()));
        self
    }

    pub fn without_tls_verification(mut self) -> Self {
        self.verify_tls = false;
        self
    }

    pub fn is_proxied(&self) -> bool {
        self.socks_addr.is_some()
    }
}
