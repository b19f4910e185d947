use serde::{Deserialize, Serialize};

/// Lifecycle of an admitted job.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// One row of the `/status` view.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub jid: String,
    pub status: JobStatus,
}

// --- Parsed scanner output (nmap `-oX` document) ---

/// Hosts reported by one scanner run, in document order.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    #[serde(rename = "host", default)]
    pub hosts: Vec<HostRecord>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HostRecord {
    #[serde(rename = "@starttime", default)]
    pub start_time: i64,
    #[serde(rename = "@endtime", default)]
    pub end_time: i64,
    #[serde(default)]
    pub status: Option<HostStatus>,
    #[serde(rename = "address", default)]
    pub addresses: Vec<AddressRecord>,
    #[serde(default)]
    pub hostnames: Option<Hostnames>,
    #[serde(default)]
    pub ports: Option<PortList>,
    #[serde(default)]
    pub os: Option<OsDetection>,
}

impl HostRecord {
    pub fn ports(&self) -> &[PortRecord] {
        self.ports.as_ref().map(|p| p.ports.as_slice()).unwrap_or(&[])
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.hostnames
            .iter()
            .flat_map(|h| h.hostnames.iter())
            .map(|h| h.name.as_str())
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HostStatus {
    #[serde(rename = "@state", default)]
    pub state: String,
    #[serde(rename = "@reason", default)]
    pub reason: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressRecord {
    #[serde(rename = "@addr")]
    pub addr: String,
    #[serde(rename = "@addrtype", default)]
    pub addr_type: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Hostnames {
    #[serde(rename = "hostname", default)]
    pub hostnames: Vec<Hostname>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Hostname {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@type", default)]
    pub kind: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PortList {
    #[serde(rename = "port", default)]
    pub ports: Vec<PortRecord>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PortRecord {
    #[serde(rename = "@protocol")]
    pub protocol: String,
    #[serde(rename = "@portid")]
    pub port_id: u16,
    pub state: PortStateRecord,
    #[serde(default)]
    pub service: Option<ServiceRecord>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PortStateRecord {
    #[serde(rename = "@state")]
    pub state: String,
    #[serde(rename = "@reason", default)]
    pub reason: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ServiceRecord {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@product", default)]
    pub product: String,
    #[serde(rename = "@version", default)]
    pub version: String,
    #[serde(rename = "@extrainfo", default)]
    pub extra_info: String,
    #[serde(rename = "@method", default)]
    pub method: String,
    #[serde(rename = "@conf", default)]
    pub conf: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct OsDetection {
    #[serde(rename = "osmatch", default)]
    pub matches: Vec<OsMatch>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct OsMatch {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@accuracy", default)]
    pub accuracy: String,
}

// --- Delivery schema (POST /api/v1/ra_api) ---

/// Body delivered to the management service for one finished job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReportPayload {
    pub jid: String,
    #[serde(rename = "externalip")]
    pub external_ip: String,
    pub hosts: Vec<HostReport>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HostReport {
    pub addresses: Vec<AddressReport>,
    #[serde(rename = "starttime")]
    pub start_time: i64,
    #[serde(rename = "endtime")]
    pub end_time: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortReport>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AddressReport {
    #[serde(rename = "addrtype")]
    pub addr_type: String,
    pub addr: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortReport {
    pub id: u16,
    pub protocol: String,
    pub state: PortStateReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReport>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortStateReport {
    pub state: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceReport {
    pub name: String,
    pub product: String,
    pub version: String,
    #[serde(rename = "extrainfo")]
    pub extra_info: String,
}

/// An operator-defined scan repeated on a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledScan {
    pub name: String,
    pub targets: String,
    pub options: String,
    pub interval: std::time::Duration,
}

impl ScheduledScan {
    /// Targets followed by flags, the same shape an inbound `options` string has.
    pub fn command_line(&self) -> String {
        if self.options.trim().is_empty() {
            self.targets.clone()
        } else {
            format!("{} {}", self.targets, self.options)
        }
    }
}
