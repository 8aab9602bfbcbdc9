//! Whole disks and the transports they are reached through.

use devgraph_api::descriptor::{DasdInfo, FcoeInfo, IscsiInfo, Transport, ZfcpInfo};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiskInfo {
    pub transport: Transport,
}

impl DiskInfo {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub fn type_name(&self) -> &'static str {
        match self.transport {
            Transport::Direct => "disk",
            Transport::Iscsi(_) => "iscsi",
            Transport::Fcoe(_) => "fcoe",
            Transport::Zfcp(_) => "zfcp",
            Transport::Dasd(_) => "dasd",
        }
    }

    pub fn dasd(&self) -> Option<&DasdInfo> {
        match self.transport {
            Transport::Dasd(ref dasd) => Some(dasd),
            _ => None,
        }
    }

    pub fn packages(&self) -> Vec<&'static str> {
        match self.transport {
            Transport::Iscsi(_) => vec!["iscsi-initiator-utils", "dracut-network"],
            Transport::Fcoe(_) => vec!["fcoe-utils", "dracut-network"],
            _ => vec![],
        }
    }

    /// Arguments the initramfs needs to attach the disk at boot.
    pub fn dracut_setup_args(&self) -> Vec<String> {
        match self.transport {
            Transport::Direct => vec![],
            Transport::Iscsi(ref iscsi) => iscsi_args(iscsi),
            Transport::Fcoe(ref fcoe) => vec![fcoe_arg(fcoe)],
            Transport::Zfcp(ref zfcp) => vec![zfcp_arg(zfcp)],
            Transport::Dasd(ref dasd) => vec![dasd_arg(dasd)],
        }
    }
}

fn iscsi_args(iscsi: &IscsiInfo) -> Vec<String> {
    if iscsi.ibft {
        return vec!["iscsi_firmware".into()];
    }

    let mut credentials = String::new();
    if let (Some(user), Some(password)) = (&iscsi.username, &iscsi.password) {
        credentials = format!("{user}:{password}");
        if let (Some(ruser), Some(rpassword)) = (&iscsi.reverse_username, &iscsi.reverse_password)
        {
            credentials.push_str(&format!(":{ruser}:{rpassword}"));
        }
    }

    // Bracket IPv6 addresses so the colon-separated fields stay parseable.
    let address = if iscsi.address.contains(':') {
        format!("[{}]", iscsi.address)
    } else {
        iscsi.address.clone()
    };

    vec![
        format!(
            "netroot=iscsi:{credentials}@{address}::{}::{}",
            iscsi.port, iscsi.node
        ),
        format!("iscsi_initiator={}", iscsi.initiator),
    ]
}

fn fcoe_arg(fcoe: &FcoeInfo) -> String {
    let dcb = if fcoe.dcb { "dcb" } else { "nodcb" };
    format!("fcoe={}:{dcb}", fcoe.nic)
}

fn zfcp_arg(zfcp: &ZfcpInfo) -> String {
    format!("rd_ZFCP={},{},{}", zfcp.hba_id, zfcp.wwpn, zfcp.fcp_lun)
}

fn dasd_arg(dasd: &DasdInfo) -> String {
    let mut arg = format!("rd_DASD={}", dasd.bus_id);
    for opt in &dasd.opts {
        arg.push_str(&format!(",{opt}=1"));
    }
    arg
}
