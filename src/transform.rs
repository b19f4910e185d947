//! Mapping from parsed scanner output to the delivery schema.

use crate::types::{
    AddressReport, HostRecord, HostReport, PortRecord, PortReport, PortStateReport, ReportPayload,
    ScanResult, ServiceReport,
};

/// Build the delivery payload for a finished job.
///
/// Host, address and port order is kept as the scanner reported it. A port
/// carries a `service` only when the scanner identified one.
pub fn to_payload(jid: &str, external_ip: &str, result: &ScanResult) -> ReportPayload {
    ReportPayload {
        jid: jid.to_string(),
        external_ip: external_ip.to_string(),
        hosts: result.hosts.iter().map(host_report).collect(),
    }
}

fn host_report(host: &HostRecord) -> HostReport {
    HostReport {
        addresses: host
            .addresses
            .iter()
            .map(|a| AddressReport {
                addr_type: a.addr_type.clone(),
                addr: a.addr.clone(),
            })
            .collect(),
        start_time: host.start_time,
        end_time: host.end_time,
        ports: host.ports().iter().map(port_report).collect(),
    }
}

fn port_report(port: &PortRecord) -> PortReport {
    PortReport {
        id: port.port_id,
        protocol: port.protocol.clone(),
        state: PortStateReport {
            state: port.state.state.clone(),
        },
        service: port.service.as_ref().map(|s| ServiceReport {
            name: s.name.clone(),
            product: s.product.clone(),
            version: s.version.clone(),
            extra_info: s.extra_info.clone(),
        }),
    }
}
