//! Manifest port spec parsing
//!
//! Accepted forms: `container`, `host:container`, `ip:host:container`.
//! The host IP defaults to `127.0.0.1`; exposing on `0.0.0.0` must be
//! explicit in the manifest.

use crate::{CoreError, Result};
use ploinky_provider::PortBinding;

/// Parse one port spec.
pub fn parse_port_spec(spec: &str) -> Result<PortBinding> {
    let parts: Vec<&str> = spec.split(':').collect();

    let binding = match parts.as_slice() {
        [port] => {
            let port = parse_port(spec, port)?;
            PortBinding {
                host_ip: "127.0.0.1".to_string(),
                host_port: port,
                container_port: port,
            }
        }
        [host, container] => PortBinding {
            host_ip: "127.0.0.1".to_string(),
            host_port: parse_port(spec, host)?,
            container_port: parse_port(spec, container)?,
        },
        [ip, host, container] => {
            if ip.is_empty() {
                return Err(CoreError::InvalidPort(spec.to_string()));
            }
            PortBinding {
                host_ip: ip.to_string(),
                host_port: parse_port(spec, host)?,
                container_port: parse_port(spec, container)?,
            }
        }
        _ => return Err(CoreError::InvalidPort(spec.to_string())),
    };

    Ok(binding)
}

/// Parse every port in a manifest, rejecting duplicate container ports.
pub fn parse_manifest_ports(specs: &[String]) -> Result<Vec<PortBinding>> {
    let mut bindings = Vec::with_capacity(specs.len());
    for spec in specs {
        let binding = parse_port_spec(spec)?;
        if bindings
            .iter()
            .any(|b: &PortBinding| b.container_port == binding.container_port)
        {
            return Err(CoreError::InvalidPort(format!(
                "duplicate container port in {spec}"
            )));
        }
        bindings.push(binding);
    }
    Ok(bindings)
}

fn parse_port(spec: &str, raw: &str) -> Result<u16> {
    let port: u16 = raw
        .parse()
        .map_err(|_| CoreError::InvalidPort(spec.to_string()))?;
    if port == 0 {
        return Err(CoreError::InvalidPort(spec.to_string()));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_port_defaults_to_loopback() {
        let binding = parse_port_spec("7000").unwrap();
        assert_eq!(binding.host_ip, "127.0.0.1");
        assert_eq!(binding.host_port, 7000);
        assert_eq!(binding.container_port, 7000);
    }

    #[test]
    fn test_host_container_pair() {
        let binding = parse_port_spec("8080:80").unwrap();
        assert_eq!(binding.host_ip, "127.0.0.1");
        assert_eq!(binding.host_port, 8080);
        assert_eq!(binding.container_port, 80);
    }

    #[test]
    fn test_explicit_ip_preserved() {
        let binding = parse_port_spec("0.0.0.0:80:7000").unwrap();
        assert_eq!(binding.host_ip, "0.0.0.0");
        assert_eq!(binding.host_port, 80);
        assert_eq!(binding.container_port, 7000);
    }

    #[test]
    fn test_invalid_specs_rejected() {
        assert!(parse_port_spec("").is_err());
        assert!(parse_port_spec("abc").is_err());
        assert!(parse_port_spec("0").is_err());
        assert!(parse_port_spec("1:2:3:4").is_err());
        assert!(parse_port_spec(":80:7000").is_err());
    }

    #[test]
    fn test_duplicate_container_port_rejected() {
        let specs = vec!["7000".to_string(), "8080:7000".to_string()];
        assert!(parse_manifest_ports(&specs).is_err());
    }
}
