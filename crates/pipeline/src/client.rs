use std::fmt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Desktop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatingSystem {
    Android,
    #[serde(rename = "iOS")]
    Ios,
    Windows,
    MacOS,
    Linux,
    Other,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Desktop => "desktop",
        })
    }
}

impl fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperatingSystem::Android => "Android",
            OperatingSystem::Ios => "iOS",
            OperatingSystem::Windows => "Windows",
            OperatingSystem::MacOS => "MacOS",
            OperatingSystem::Linux => "Linux",
            OperatingSystem::Other => "Other",
        })
    }
}

/// What we know about the submitting client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub device_class: DeviceClass,
    pub operating_system: OperatingSystem,
    pub source_ip: String,
}

impl ClientMetadata {
    /// Classify a client from its User-Agent header
    pub fn from_user_agent(user_agent: &str, source_ip: &str) -> Self {
        let ua = user_agent.to_lowercase();

        let device_class = if ua.contains("mobile") {
            DeviceClass::Mobile
        } else {
            DeviceClass::Desktop
        };

        // Order matters: Android UAs also contain "linux", iPad UAs contain "mac os"
        let operating_system = if ua.contains("android") {
            OperatingSystem::Android
        } else if ua.contains("iphone") || ua.contains("ipad") {
            OperatingSystem::Ios
        } else if ua.contains("windows") {
            OperatingSystem::Windows
        } else if ua.contains("macintosh") {
            OperatingSystem::MacOS
        } else if ua.contains("linux") {
            OperatingSystem::Linux
        } else {
            OperatingSystem::Other
        };

        ClientMetadata {
            device_class,
            operating_system,
            source_ip: source_ip.to_string(),
        }
    }

    /// Device column of the statistics log, e.g. `mobile (Android)`
    pub fn device_label(&self) -> String {
        format!("{} ({})", self.device_class, self.operating_system)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANDROID: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 Chrome/120.0 Mobile Safari/537.36";
    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 Mobile/15E148";
    const WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36";
    const MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 Safari/605.1.15";
    const LINUX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

    #[test]
    fn test_user_agent_classification() {
        let cases = [
            (ANDROID, DeviceClass::Mobile, OperatingSystem::Android),
            (IPHONE, DeviceClass::Mobile, OperatingSystem::Ios),
            (WINDOWS, DeviceClass::Desktop, OperatingSystem::Windows),
            (MAC, DeviceClass::Desktop, OperatingSystem::MacOS),
            (LINUX, DeviceClass::Desktop, OperatingSystem::Linux),
            ("curl/8.5.0", DeviceClass::Desktop, OperatingSystem::Other),
        ];

        for (ua, device, os) in cases {
            let meta = ClientMetadata::from_user_agent(ua, "10.0.0.1");
            assert_eq!(meta.device_class, device, "{}", ua);
            assert_eq!(meta.operating_system, os, "{}", ua);
        }
    }

    #[test]
    fn test_device_label() {
        let meta = ClientMetadata::from_user_agent(ANDROID, "10.0.0.1");
        assert_eq!(meta.device_label(), "mobile (Android)");
        assert_eq!(meta.source_ip, "10.0.0.1");
    }
}
