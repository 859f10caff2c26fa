//! websockify command line construction.

use crate::runtime::options::TlsOptions;

/// Inputs for one proxy command line.
#[derive(Debug, Clone)]
pub struct ProxyArgs<'a> {
    pub listen_address: &'a str,
    pub public_port: u16,
    pub display_address: &'a str,
    pub display_port: u16,
    /// Serve TLS only when set.
    pub tls: Option<&'a TlsOptions>,
}

impl ProxyArgs<'_> {
    pub fn build(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(7);
        if let Some(tls) = self.tls {
            args.push("--cert".to_string());
            args.push(tls.cert.to_string_lossy().into_owned());
            args.push("--key".to_string());
            args.push(tls.key.to_string_lossy().into_owned());
            args.push("--ssl-only".to_string());
        }
        args.push(format!("{}:{}", self.listen_address, self.public_port));
        args.push(format!("{}:{}", self.display_address, self.display_port));
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_plain_proxy() {
        let args = ProxyArgs {
            listen_address: "0.0.0.0",
            public_port: 5702,
            display_address: "127.0.0.1",
            display_port: 5902,
            tls: None,
        }
        .build();
        assert_eq!(args, vec!["0.0.0.0:5702", "127.0.0.1:5902"]);
    }

    #[test]
    fn test_tls_proxy_is_ssl_only() {
        let tls = TlsOptions {
            cert: PathBuf::from("/etc/buffet/cert.pem"),
            key: PathBuf::from("/etc/buffet/key.pem"),
        };
        let args = ProxyArgs {
            listen_address: "0.0.0.0",
            public_port: 5700,
            display_address: "127.0.0.1",
            display_port: 5900,
            tls: Some(&tls),
        }
        .build();
        assert_eq!(
            args,
            vec![
                "--cert",
                "/etc/buffet/cert.pem",
                "--key",
                "/etc/buffet/key.pem",
                "--ssl-only",
                "0.0.0.0:5700",
                "127.0.0.1:5900",
            ]
        );
    }
}
