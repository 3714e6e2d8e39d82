// brokerage-core/src/net.rs

//! Host identity resolution.
//!
//! Workers are identified on the folder transport by host name (or resolved
//! IPv4 string). On macOS the primary IPv4 of `en0` is preferred over the
//! host name, which is frequently unresolvable from other machines.

use std::net::Ipv4Addr;

/// Resolved identity of the local host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub host_name: String,
    pub domain_name: Option<String>,
    pub ipv4: Option<Ipv4Addr>,
}

impl HostIdentity {
    /// Resolves the local host's identity.
    pub async fn resolve() -> Self {
        let host_name = host_name().unwrap_or_else(|_| "localhost".to_string());

        #[cfg(target_os = "macos")]
        let host_name = primary_interface_ipv4()
            .map(|ip| ip.to_string())
            .unwrap_or(host_name);

        let ipv4 = resolve_ipv4(&host_name).await;

        Self {
            host_name,
            domain_name: domain_name(),
            ipv4,
        }
    }

    /// Fully-qualified domain name, when a domain is known.
    pub fn fqdn(&self) -> Option<String> {
        self.domain_name
            .as_ref()
            .map(|domain| format!("{}.{domain}", self.host_name))
    }

    /// The file name this host publishes under: IPv4 string when resolved,
    /// host name otherwise.
    pub fn presence_file_name(&self) -> String {
        match self.ipv4 {
            Some(ip) => ip.to_string(),
            None => self.host_name.clone(),
        }
    }

    /// Whether `name` refers to this host (host name, own IPv4, or loopback).
    pub fn is_self(&self, name: &str) -> bool {
        if name.eq_ignore_ascii_case(&self.host_name) || name == "127.0.0.1" {
            return true;
        }
        match self.ipv4 {
            Some(ip) => name == ip.to_string(),
            None => false,
        }
    }
}

/// Resolves a host name to its first IPv4 address.
pub async fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    // Already a literal address?
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(ip);
    }

    let addrs = tokio::net::lookup_host((host, 0)).await.ok()?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Some(*v4.ip());
        }
    }
    None
}

pub fn host_name() -> std::io::Result<String> {
    #[cfg(unix)]
    {
        let mut buf = vec![0u8; 256];
        // SAFETY: gethostname writes a null-terminated string into buf
        let ret =
            unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        buf.truncate(len);
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "no host name"))
    }
}

pub fn domain_name() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        let mut buf = vec![0u8; 256];
        // SAFETY: getdomainname writes a null-terminated string into buf
        let ret =
            unsafe { libc::getdomainname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if ret != 0 {
            return None;
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        buf.truncate(len);
        let domain = String::from_utf8_lossy(&buf).into_owned();
        if domain.is_empty() || domain == "(none)" {
            None
        } else {
            Some(domain)
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        std::env::var("USERDOMAIN").ok().filter(|d| !d.is_empty())
    }
}

/// The primary IPv4 of interface `en0`, when present.
#[cfg(target_os = "macos")]
pub fn primary_interface_ipv4() -> Option<Ipv4Addr> {
    use std::ffi::CStr;

    let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs allocates a linked list released by freeifaddrs below;
    // each entry's ifa_addr is checked for AF_INET before the sockaddr_in cast.
    unsafe {
        if libc::getifaddrs(&mut addrs) != 0 {
            return None;
        }

        let mut found = None;
        let mut cursor = addrs;
        while !cursor.is_null() {
            let entry = &*cursor;
            if !entry.ifa_addr.is_null() {
                let family = i32::from((*entry.ifa_addr).sa_family);
                if family == libc::AF_INET
                    && CStr::from_ptr(entry.ifa_name).to_bytes() == b"en0"
                {
                    let sin = &*(entry.ifa_addr as *const libc::sockaddr_in);
                    found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
                    break;
                }
            }
            cursor = entry.ifa_next;
        }

        libc::freeifaddrs(addrs);
        found
    }
}
