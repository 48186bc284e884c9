//! The local TUN virtual network interface (§4.1): open and configure a
//! `tun::AsyncDevice`, then split it into an independent reader and writer
//! half. Per-platform framing prefixes are handled separately in
//! [`platform`].

mod platform;

use std::io;
use std::net::{IpAddr, Ipv6Addr};
use std::process::Command;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tun::AsyncDevice;

use crate::config::InterfaceConfig;
use crate::error::{CoreError, CoreResult};
use platform::FramingKind;

/// The read side of the adapter seam the forwarding engine drives (§4.5's
/// egress source). A trait rather than a concrete type so the engine can be
/// exercised against an in-memory double in tests, without opening a real
/// kernel device.
#[async_trait]
pub trait PacketSource: Send {
    async fn read_packet(&mut self, buf: &mut [u8]) -> CoreResult<usize>;
}

/// The write side of the adapter seam (§4.5's ingress sink).
#[async_trait]
pub trait PacketSink: Send {
    async fn write_packet(&mut self, packet: &[u8]) -> CoreResult<()>;
}

/// A just-opened, configured TUN device, not yet brought up or split. Held
/// only long enough to call [`AdapterHandle::up`] then [`AdapterHandle::split`];
/// the one-reader/one-writer invariant (§4.5: "adapter I/O ... exactly one
/// reader task and one writer task") is enforced by that split consuming
/// `self`.
pub struct AdapterHandle {
    device: AsyncDevice,
    name: String,
    mtu: usize,
}

impl AdapterHandle {
    /// Create and address the device, but leave the link down (§4.1's
    /// `open` step precedes `up`). The tunnel address plane supports both
    /// families: an IPv4 pair is handed straight to the `tun` builder, an
    /// IPv6 pair is applied with a post-create address assignment since the
    /// builder's `address`/`netmask` only accept IPv4.
    pub fn open(cfg: &InterfaceConfig) -> CoreResult<Self> {
        let mut config = tun::Configuration::default();
        config.name(&cfg.name).mtu(cfg.mtu as i32);

        let ipv6_assignment = match (cfg.address, cfg.netmask) {
            (IpAddr::V4(address), IpAddr::V4(netmask)) => {
                config.address(address).netmask(netmask);
                None
            }
            (IpAddr::V6(address), IpAddr::V6(netmask)) => {
                Some((address, ipv6_prefix_len(netmask)?))
            }
            _ => {
                return Err(CoreError::ConfigInvalid(
                    "interface.address and interface.netmask must be the same ip version".into(),
                ))
            }
        };

        #[cfg(target_os = "linux")]
        config.platform(|platform_config| {
            platform_config.packet_information(false);
        });

        let device = tun::create_as_async(&config).map_err(|e| {
            CoreError::AdapterCreate(io::Error::new(io::ErrorKind::Other, e.to_string()))
        })?;

        if let Some((address, prefix_len)) = ipv6_assignment {
            assign_ipv6(&cfg.name, address, prefix_len)?;
        }

        Ok(Self {
            device,
            name: cfg.name.clone(),
            mtu: cfg.mtu as usize,
        })
    }

    /// Name actually assigned by the kernel; may differ from the requested
    /// name on platforms that don't honor it verbatim.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bring the link up (§4.1's `up` transition). Must run before
    /// `split`, since it still needs exclusive access to `self`.
    pub fn up(&self) -> CoreResult<()> {
        set_link_up(&self.name, true)
    }

    /// Bring the link down (§4.1's `down` transition). Takes the interface
    /// name rather than `&self` because by the time a session tears down,
    /// the handle has already been consumed by [`split`](Self::split).
    pub fn down(name: &str) -> CoreResult<()> {
        set_link_up(name, false)
    }

    /// Idempotent teardown: bring the link down if it isn't already. Safe
    /// to call more than once, or after the device has already gone away.
    pub fn close(name: &str) {
        if let Err(err) = Self::down(name) {
            log::warn!("bringing down adapter {name} during close: {err}");
        }
    }

    /// Split into an independent reader and writer half. Each half owns its
    /// stream half exclusively; nothing else may call `read`/`write` on
    /// this device afterward.
    pub fn split(self) -> (AdapterReader, AdapterWriter) {
        let (read_half, write_half) = tokio::io::split(self.device);
        let framing = platform::current();
        (
            AdapterReader {
                inner: read_half,
                framing,
                mtu: self.mtu,
            },
            AdapterWriter {
                inner: write_half,
                framing,
            },
        )
    }
}

pub struct AdapterReader {
    inner: ReadHalf<AsyncDevice>,
    framing: FramingKind,
    mtu: usize,
}

#[async_trait]
impl PacketSource for AdapterReader {
    /// Read one IP packet into `buf`, stripping any platform prefix. `buf`
    /// must be at least `mtu + 4` bytes to hold the largest possible
    /// prefixed device read.
    async fn read_packet(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        let mut raw = vec![0u8; self.mtu + 4];
        let n = self.inner.read(&mut raw).await.map_err(CoreError::AdapterIo)?;

        let packet = platform::strip(self.framing, &raw[..n]).ok_or_else(|| {
            CoreError::AdapterIo(io::Error::new(
                io::ErrorKind::InvalidData,
                "adapter read shorter than the platform prefix",
            ))
        })?;

        if packet.len() > buf.len() {
            return Err(CoreError::AdapterIo(io::Error::new(
                io::ErrorKind::InvalidData,
                "adapter packet exceeds mtu buffer",
            )));
        }

        buf[..packet.len()].copy_from_slice(packet);
        Ok(packet.len())
    }
}

pub struct AdapterWriter {
    inner: WriteHalf<AsyncDevice>,
    framing: FramingKind,
}

impl AdapterWriter {
    pub async fn shutdown(&mut self) -> CoreResult<()> {
        self.inner.shutdown().await.map_err(CoreError::AdapterIo)
    }
}

#[async_trait]
impl PacketSink for AdapterWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> CoreResult<()> {
        let mut out = Vec::with_capacity(packet.len() + 4);
        platform::prepend(self.framing, packet, &mut out);
        self.inner.write_all(&out).await.map_err(CoreError::AdapterIo)
    }
}

/// Substitute the server's per-session `{id}` placeholder into an interface
/// name template.
pub fn resolve_name_template(template: &str, id: usize) -> String {
    template.replace("{id}", &id.to_string())
}

/// Derive a prefix length from an IPv6 address-shaped netmask, the same way
/// an IPv4 dotted-quad netmask is conventionally read: a run of leading
/// one-bits followed by all zero-bits. Rejects anything not of that shape.
fn ipv6_prefix_len(netmask: Ipv6Addr) -> CoreResult<u8> {
    let bits = u128::from(netmask);
    let ones = bits.leading_ones();
    let expected = if ones == 128 { u128::MAX } else { !(u128::MAX >> ones) };

    if bits != expected {
        return Err(CoreError::ConfigInvalid(
            "interface.netmask is not a contiguous IPv6 prefix mask".into(),
        ));
    }

    Ok(ones as u8)
}

/// Assign an IPv6 address to an already-created device. The `tun` builder
/// has no IPv6 equivalent of `address`/`netmask`, so this shells out to the
/// platform's own address-management tool, the same way [`set_link_up`]
/// does for bringing the link up and down.
fn assign_ipv6(name: &str, address: Ipv6Addr, prefix_len: u8) -> CoreResult<()> {
    let mut cmd = ipv6_assign_command(name, address, prefix_len);
    let status = cmd.status().map_err(CoreError::AdapterConfigure)?;

    if !status.success() {
        return Err(CoreError::AdapterConfigure(io::Error::new(
            io::ErrorKind::Other,
            format!("assigning ipv6 address to {name} exited with {status}"),
        )));
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn ipv6_assign_command(name: &str, address: Ipv6Addr, prefix_len: u8) -> Command {
    let mut cmd = Command::new("ip");
    cmd.args(["-6", "addr", "add", &format!("{address}/{prefix_len}"), "dev", name]);
    cmd
}

#[cfg(target_os = "macos")]
fn ipv6_assign_command(name: &str, address: Ipv6Addr, prefix_len: u8) -> Command {
    let mut cmd = Command::new("ifconfig");
    cmd.args([name, "inet6", &address.to_string(), "prefixlen", &prefix_len.to_string()]);
    cmd
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn ipv6_assign_command(_name: &str, _address: Ipv6Addr, _prefix_len: u8) -> Command {
    // Kept as a Command so the caller's shape stays uniform; its status is
    // never success, which surfaces as a clear AdapterConfigure error.
    Command::new("false")
}

/// Bring the named interface's link up or down (§4.1's `up`/`down`
/// transitions), via the platform's own link-management tool rather than
/// an ioctl this crate would otherwise have to hand-roll per platform.
#[cfg(target_os = "linux")]
fn set_link_up(name: &str, up: bool) -> CoreResult<()> {
    let state = if up { "up" } else { "down" };
    let status = Command::new("ip")
        .args(["link", "set", "dev", name, state])
        .status()
        .map_err(CoreError::AdapterConfigure)?;

    if !status.success() {
        return Err(CoreError::AdapterConfigure(io::Error::new(
            io::ErrorKind::Other,
            format!("setting {name} {state} exited with {status}"),
        )));
    }

    Ok(())
}

#[cfg(target_os = "macos")]
fn set_link_up(name: &str, up: bool) -> CoreResult<()> {
    let state = if up { "up" } else { "down" };
    let status = Command::new("ifconfig")
        .args([name, state])
        .status()
        .map_err(CoreError::AdapterConfigure)?;

    if !status.success() {
        return Err(CoreError::AdapterConfigure(io::Error::new(
            io::ErrorKind::Other,
            format!("setting {name} {state} exited with {status}"),
        )));
    }

    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn set_link_up(name: &str, _up: bool) -> CoreResult<()> {
    Err(CoreError::ConfigInvalid(format!(
        "bringing up/down adapter {name} is not supported on this platform"
    )))
}
