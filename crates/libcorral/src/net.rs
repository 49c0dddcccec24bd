// crates/libcorral/src/net.rs
//
// Virtual interface creation into the target's network namespace. One
// RTM_NEWLINK request per interface, with IFLA_NET_NS_PID stamped so the
// kernel instantiates the device directly inside the target's netns.

use anyhow::{Context, Result, anyhow, bail};
use log::debug;
use netlink_packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload,
};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use nix::net::if_::if_nametoindex;
use nix::unistd::Pid;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicKind {
    Dummy,
    Macvlan,
    Ipvlan,
}

impl NicKind {
    fn info_kind(self) -> InfoKind {
        match self {
            NicKind::Dummy => InfoKind::Dummy,
            NicKind::Macvlan => InfoKind::MacVlan,
            NicKind::Ipvlan => InfoKind::IpVlan,
        }
    }

    fn needs_link(self) -> bool {
        !matches!(self, NicKind::Dummy)
    }
}

impl fmt::Display for NicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NicKind::Dummy => "dummy",
            NicKind::Macvlan => "macvlan",
            NicKind::Ipvlan => "ipvlan",
        })
    }
}

impl FromStr for NicKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dummy" => Ok(NicKind::Dummy),
            "macvlan" => Ok(NicKind::Macvlan),
            "ipvlan" => Ok(NicKind::Ipvlan),
            other => Err(format!("unknown nic kind {other:?}")),
        }
    }
}

/// One interface to create in the target's netns, written
/// `name:kind[:host-link]` on the command line and in config files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicSpec {
    pub name: String,
    pub kind: NicKind,
    pub link: Option<String>,
}

impl fmt::Display for NicSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.link {
            Some(link) => write!(f, "{}:{}:{}", self.name, self.kind, link),
            None => write!(f, "{}:{}", self.name, self.kind),
        }
    }
}

impl FromStr for NicSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(':');
        let (name, kind) = match (fields.next(), fields.next()) {
            (Some(name), Some(kind)) if !name.is_empty() => (name, kind),
            _ => return Err(format!("nic spec {s:?} is not name:kind[:host-link]")),
        };
        if name.len() >= libc::IFNAMSIZ {
            return Err(format!("interface name {name:?} is too long"));
        }
        let kind: NicKind = kind.parse()?;
        let link = fields.next().map(str::to_owned);
        if fields.next().is_some() {
            return Err(format!("nic spec {s:?} has trailing fields"));
        }
        if kind.needs_link() && link.is_none() {
            return Err(format!("{kind} interfaces need a host link: {s:?}"));
        }
        Ok(NicSpec {
            name: name.to_owned(),
            kind,
            link,
        })
    }
}

/// Create every requested interface inside `tp`'s network namespace. Must
/// run with CAP_NET_ADMIN effective.
pub fn create_nics(tp: Pid, nics: &[NicSpec]) -> Result<()> {
    let socket = Socket::new(NETLINK_ROUTE).context("open route-netlink socket")?;
    socket
        .connect(&SocketAddr::new(0, 0))
        .context("connect route-netlink socket")?;
    for (i, nic) in nics.iter().enumerate() {
        create_one(&socket, i as u32 + 1, tp, nic)?;
    }
    Ok(())
}

fn create_one(socket: &Socket, seq: u32, tp: Pid, nic: &NicSpec) -> Result<()> {
    let mut link = LinkMessage::default();
    link.attributes.push(LinkAttribute::IfName(nic.name.clone()));
    link.attributes
        .push(LinkAttribute::NetNsPid(tp.as_raw() as u32));
    if let Some(parent) = &nic.link {
        let index = if_nametoindex(parent.as_str())
            .with_context(|| format!("resolve host interface {parent:?}"))?;
        link.attributes.push(LinkAttribute::Link(index));
    }
    link.attributes
        .push(LinkAttribute::LinkInfo(vec![LinkInfo::Kind(
            nic.kind.info_kind(),
        )]));

    let mut msg = NetlinkMessage::from(RouteNetlinkMessage::NewLink(link));
    msg.header.flags = NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL;
    msg.header.sequence_number = seq;
    msg.finalize();

    let mut buf = vec![0u8; msg.buffer_len()];
    msg.serialize(&mut buf);
    socket
        .send(&buf, 0)
        .with_context(|| format!("RTM_NEWLINK {}", nic))?;

    let mut rbuf = vec![0u8; 8192];
    let n = socket
        .recv(&mut &mut rbuf[..], 0)
        .context("read netlink ack")?;
    let reply = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&rbuf[..n])
        .map_err(|e| anyhow!("parse netlink ack: {e}"))?;
    match reply.payload {
        NetlinkPayload::Error(err) => {
            if err.code.is_some() {
                return Err(err.to_io()).with_context(|| format!("create {}", nic));
            }
        }
        other => bail!("unexpected netlink reply {other:?}"),
    }
    debug!("created {} in netns of pid {}", nic, tp);
    Ok(())
}
