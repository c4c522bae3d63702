//! 蓝牙侧：适配器配置、HID Profile 注册、L2CAP 监听与出站连接。

use anyhow::{Context, Result, anyhow};
use bluer::l2cap::{SeqPacket, SeqPacketListener, Socket, SocketAddr};
use bluer::rfcomm::{Profile, ProfileHandle, Role};
use bluer::{Adapter, Address, AddressType, Session};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use uuid::Uuid;

pub const PSM_HID_CONTROL: u16 = 0x0011; // 17
pub const PSM_HID_INTERRUPT: u16 = 0x0013; // 19

/// 设备类 0x0025C0：键盘 + 指点设备的组合外设
const DEVICE_CLASS: &str = "0x0025C0";
const ADAPTER_ALIAS: &str = "Pi Keyboard/Mouse";
const HID_UUID: &str = "00001124-0000-1000-8000-00805f9b34fb";

const HID_SDP_RECORD: &str = r#"
<?xml version="1.0" encoding="UTF-8" ?>
<record>
  <attribute id="0x0001">
    <sequence>
      <uuid value="0x1124" />
    </sequence>
  </attribute>
  <attribute id="0x0004">
    <sequence>
      <sequence>
        <uuid value="0x0100" />
        <uint16 value="0x0011" />
      </sequence>
      <sequence>
        <uuid value="0x0011" />
      </sequence>
    </sequence>
  </attribute>
  <attribute id="0x0005">
    <sequence>
      <uuid value="0x1002" />
    </sequence>
  </attribute>
  <attribute id="0x0006">
    <sequence>
      <uint16 value="0x656e" />
      <uint16 value="0x006a" />
      <uint16 value="0x0100" />
    </sequence>
  </attribute>
  <attribute id="0x0009">
    <sequence>
      <sequence>
        <uuid value="0x1124" />
        <uint16 value="0x0100" />
      </sequence>
    </sequence>
  </attribute>
  <attribute id="0x000d">
    <sequence>
      <sequence>
        <sequence>
          <uuid value="0x0100" />
          <uint16 value="0x0013" />
        </sequence>
        <sequence>
          <uuid value="0x0011" />
        </sequence>
      </sequence>
    </sequence>
  </attribute>
  <attribute id="0x0100">
    <text value="Pi Keyboard/Mouse" />
  </attribute>
  <attribute id="0x0101">
    <text value="Bluetooth HID switch" />
  </attribute>
  <attribute id="0x0102">
    <text value="Raspberry Pi" />
  </attribute>
  <attribute id="0x0200">
    <uint16 value="0x0100" />
  </attribute>
  <attribute id="0x0201">
    <uint16 value="0x0111" />
  </attribute>
  <attribute id="0x0202">
    <uint8 value="0xC0" />
  </attribute>
  <attribute id="0x0203">
    <uint8 value="0x21" />
  </attribute>
  <attribute id="0x0204">
    <boolean value="true" />
  </attribute>
  <attribute id="0x0205">
    <boolean value="true" />
  </attribute>
  <attribute id="0x0206">
    <sequence>
      <sequence>
        <uint8 value="0x22" />
        <text encoding="hex" value="05010906a1018501050719e029e71500250175019508810295017508810195057501050819012905910295017503910195067508150025650507190029658100c005010902a10185020901a1000509190129031500250195037501810295057501810105010930093109381581257f750895038106c0c0" />
      </sequence>
    </sequence>
  </attribute>
  <attribute id="0x0207">
    <sequence>
      <sequence>
        <uint16 value="0x0409" />
        <uint16 value="0x0100" />
      </sequence>
    </sequence>
  </attribute>
  <attribute id="0x0209">
    <uint16 value="0x0012" />
  </attribute>
  <attribute id="0x020A">
    <uint16 value="0x0640" />
  </attribute>
</record>
"#;

/// HID 的两条 L2CAP 通道
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Control,
    Interrupt,
}

/// 配置适配器并向 BlueZ 注册 HID Profile。
/// 返回的 ProfileHandle 存活期间 SDP 记录一直有效，调用方需要一直持有。
pub async fn setup_adapter(session: &Session) -> Result<(Adapter, ProfileHandle)> {
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    adapter.set_alias(ADAPTER_ALIAS.to_string()).await?;
    info!("蓝牙适配器已配置: {}", adapter.name());
    info!("适配器地址: {}", adapter.address().await?);

    // bluer 不暴露设备类，沿用 hciconfig 设置
    match tokio::process::Command::new("hciconfig")
        .args([adapter.name(), "class", DEVICE_CLASS])
        .status()
        .await
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("设置设备类失败: {status}"),
        Err(e) => warn!("执行 hciconfig 失败: {e}"),
    }

    let profile = Profile {
        uuid: Uuid::parse_str(HID_UUID)?,
        name: Some(ADAPTER_ALIAS.to_string()),
        service_record: Some(HID_SDP_RECORD.to_string()),
        role: Some(Role::Server),
        auto_connect: Some(true),
        require_authentication: Some(false),
        require_authorization: Some(false),
        ..Default::default()
    };
    let handle = session
        .register_profile(profile)
        .await
        .context("注册 HID Profile 失败")?;
    info!("HID Profile 已通过 ProfileManager1 注册");
    Ok((adapter, handle))
}

/// 进入可配对模式，等待新的远端主机发起配对
pub async fn enter_pairable(adapter: &Adapter) {
    info!("进入可配对模式");
    if let Err(e) = adapter.set_pairable(true).await {
        warn!("设置 pairable 失败: {e}");
    }
    if let Err(e) = adapter.set_discoverable(true).await {
        warn!("设置 discoverable 失败: {e}");
    }
}

/// 绑定控制/中断两条通道的 L2CAP 监听套接字
pub fn bind_listeners() -> Result<(SeqPacketListener, SeqPacketListener)> {
    let control = listen_on(PSM_HID_CONTROL)
        .map_err(|e| anyhow!("绑定控制通道失败 (PSM 17): {e}. 是否缺少 root 权限？"))?;
    let interrupt =
        listen_on(PSM_HID_INTERRUPT).map_err(|e| anyhow!("绑定中断通道失败 (PSM 19): {e}"))?;
    info!("正在监听 L2CAP PSM 17(Control) 和 19(Interrupt)...");
    Ok((control, interrupt))
}

fn listen_on(psm: u16) -> io::Result<SeqPacketListener> {
    let socket = Socket::<SeqPacket>::new_seq_packet()?;
    enable_reuse_addr(socket.as_raw_fd())?;
    socket.bind(SocketAddr::new(Address::any(), AddressType::BrEdr, psm))?;
    socket.listen(5)
}

fn enable_reuse_addr(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// 一次已见分晓的出站连接
pub struct Outbound {
    pub addr: Address,
    pub psm: u16,
    pub result: io::Result<SeqPacket>,
}

/// 进行中的出站连接集合。连接是非阻塞的：future 完成时
/// in-progress 的 connect 已解析完 SO_ERROR。
#[derive(Default)]
pub struct Connector {
    pending: FuturesUnordered<BoxFuture<'static, Outbound>>,
}

impl Connector {
    pub fn start(&mut self, addr: Address, psm: u16) {
        debug!("Connecting to {addr} (PSM {psm})");
        self.pending.push(Box::pin(async move {
            let result = SeqPacket::connect(SocketAddr::new(addr, AddressType::BrEdr, psm)).await;
            Outbound { addr, psm, result }
        }));
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// 等待任意一个出站连接见分晓；没有挂起的连接时永远挂起
    pub async fn next_done(&mut self) -> Outbound {
        if self.pending.is_empty() {
            std::future::pending::<()>().await;
        }
        self.pending.next().await.expect("pending 集合非空")
    }
}
