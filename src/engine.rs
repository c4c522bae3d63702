//! 单线程就绪循环：把所有描述符多路复用到一个协作式事件循环上。
//!
//! 每一圈重新搭建各事件源的 future，等到一件事就处理一件事；
//! 处理代码运行时竞争的 future 已全部丢弃，摘除条目不会影响
//! 还在轮询中的描述符。分发优先级固定：退出信号、出站连接完成、
//! 热插拔、输入事件、远端来帧、中断监听、控制监听。

use crate::bluetooth::{
    self, ChannelKind, Connector, Outbound, PSM_HID_CONTROL, PSM_HID_INTERRUPT,
};
use crate::config::ConfigStore;
use crate::hotkey::Action;
use crate::input::{Decoded, HotplugAction, HotplugChange, HotplugMonitor, InputFleet};
use crate::registry::Registry;
use crate::report;
use anyhow::{Context, Result};
use bluer::Adapter;
use bluer::l2cap::{SeqPacket, SeqPacketListener, SocketAddr};
use bluer::rfcomm::ProfileHandle;
use log::{debug, info, warn};
use std::io;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// 一圈循环等到的事件
enum LoopEvent {
    Shutdown,
    Outbound(Outbound),
    Hotplug(io::Result<HotplugChange>),
    Input {
        slot: usize,
        result: io::Result<evdev::InputEvent>,
    },
    Frame {
        index: i32,
        kind: ChannelKind,
        result: io::Result<Vec<u8>>,
    },
    Inbound {
        kind: ChannelKind,
        result: io::Result<(SeqPacket, SocketAddr)>,
    },
}

pub struct Engine {
    // Session 与 ProfileHandle 存活期间 SDP 注册才有效
    _session: bluer::Session,
    adapter: Adapter,
    _profile: ProfileHandle,
    control_listener: SeqPacketListener,
    interrupt_listener: SeqPacketListener,
    registry: Registry,
    fleet: InputFleet,
    connector: Connector,
    hotplug: HotplugMonitor,
    shutdown: CancellationToken,
}

impl Engine {
    /// 组装全部组件；任何一步失败都在进入主循环前中止
    pub async fn new(config: PathBuf) -> Result<Self> {
        let session = bluer::Session::new().await?;
        let (adapter, profile) = bluetooth::setup_adapter(&session).await?;
        let (control_listener, interrupt_listener) = bluetooth::bind_listeners()?;

        let store = ConfigStore::load(config)?;
        let registry = Registry::new(store);

        let mut fleet = InputFleet::default();
        fleet
            .scan(registry.current_index() != -1)
            .context("扫描输入设备失败")?;
        let hotplug = HotplugMonitor::new().context("创建 udev 监视器失败")?;

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        });

        Ok(Self {
            _session: session,
            adapter,
            _profile: profile,
            control_listener,
            interrupt_listener,
            registry,
            fleet,
            connector: Connector::default(),
            hotplug,
            shutdown,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        info!("进入主循环");
        loop {
            let event = {
                let Self {
                    registry,
                    fleet,
                    connector,
                    hotplug,
                    control_listener,
                    interrupt_listener,
                    shutdown,
                    ..
                } = &mut self;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => LoopEvent::Shutdown,
                    outbound = connector.next_done() => LoopEvent::Outbound(outbound),
                    change = hotplug.next_change() => LoopEvent::Hotplug(change),
                    (slot, result) = fleet.next_event() => LoopEvent::Input { slot, result },
                    (index, kind, result) = registry.next_frame() => LoopEvent::Frame { index, kind, result },
                    result = interrupt_listener.accept() => LoopEvent::Inbound { kind: ChannelKind::Interrupt, result },
                    result = control_listener.accept() => LoopEvent::Inbound { kind: ChannelKind::Control, result },
                }
            };
            match event {
                LoopEvent::Shutdown => {
                    info!("收到退出信号，向所有远端释放按键");
                    self.registry.send_all(&report::KEYBOARD_RELEASE).await;
                    self.registry.send_all(&report::MOUSE_RELEASE).await;
                    return Ok(());
                }
                LoopEvent::Outbound(outbound) => self.on_outbound(outbound),
                LoopEvent::Hotplug(Ok(change)) => self.on_hotplug(change),
                LoopEvent::Hotplug(Err(e)) => warn!("读取热插拔事件失败: {e}"),
                LoopEvent::Input { slot, result } => self.on_input(slot, result).await,
                LoopEvent::Frame { index, kind, result } => {
                    self.on_frame(index, kind, result).await
                }
                LoopEvent::Inbound { kind, result } => self.on_inbound(kind, result),
            }
        }
    }

    /// 出站连接见分晓：控制通道通了再补中断通道，任一失败只记日志
    fn on_outbound(&mut self, outbound: Outbound) {
        match outbound.result {
            Ok(sock) => {
                debug!("Connected: {} (PSM {})", outbound.addr, outbound.psm);
                match outbound.psm {
                    PSM_HID_CONTROL => {
                        self.registry.get_or_create(outbound.addr).set_control(sock);
                        self.connector.start(outbound.addr, PSM_HID_INTERRUPT);
                    }
                    _ => self.registry.get_or_create(outbound.addr).set_interrupt(sock),
                }
            }
            Err(e) => warn!(
                "Connection error: {} (PSM {}): {e}",
                outbound.addr, outbound.psm
            ),
        }
    }

    fn on_hotplug(&mut self, change: HotplugChange) {
        match change.action {
            HotplugAction::Add => self.fleet.add_node(
                &change.node,
                change.keyboard,
                change.mouse,
                // 独占策略对热插拔进来的设备同样生效
                self.registry.current_index() != -1,
            ),
            HotplugAction::Remove => self.fleet.remove_node(&change.node),
        }
    }

    async fn on_input(&mut self, slot: usize, result: io::Result<evdev::InputEvent>) {
        match result {
            Ok(event) => {
                let (delay, speed) = self.registry.mouse_tuning();
                match self.fleet.decode(slot, &event, delay, speed) {
                    Decoded::Report(frame) => self.registry.send_current(&frame).await,
                    Decoded::Hotkey(action) => self.apply(action).await,
                    Decoded::Nothing => {}
                }
            }
            // 设备被拔掉：摘掉该节点的全部通道
            Err(e) if e.raw_os_error() == Some(libc::ENODEV) => {
                if let Some(node) = self.fleet.node_of(slot) {
                    self.fleet.remove_node(&node);
                }
            }
            Err(e) => warn!("读取输入事件失败: {e}"),
        }
    }

    async fn apply(&mut self, action: Action) {
        match action {
            Action::EnterPairable => bluetooth::enter_pairable(&self.adapter).await,
            Action::Select(index) => {
                self.registry
                    .set_current(index, &mut self.fleet, &mut self.connector)
                    .await
            }
        }
    }

    /// 远端来帧。空读或出错丢弃对应套接字，状态机随之推导；
    /// 控制通道应答 0x71 握手，中断通道应用 LED 输出报告。
    async fn on_frame(&mut self, index: i32, kind: ChannelKind, result: io::Result<Vec<u8>>) {
        let Some(remote) = self.registry.remote_mut(index) else {
            return;
        };
        match (kind, result) {
            (ChannelKind::Control, Ok(data)) => {
                if data.is_empty() {
                    remote.drop_control();
                    return;
                }
                debug!("CTL {} 收到 {}", remote.addr, hex(&data));
                if data == [0x71] {
                    remote.reply_control(&[0x00]).await;
                }
            }
            (ChannelKind::Control, Err(e)) => {
                debug!("{} 控制通道: {e}", remote.addr);
                remote.drop_control();
            }
            (ChannelKind::Interrupt, Ok(data)) => {
                if data.is_empty() {
                    remote.drop_interrupt();
                    return;
                }
                debug!("INT {} 收到 {}", remote.addr, hex(&data));
                if data.len() >= 3 && data[0..2] == [0xA2, 0x01] {
                    // LED 输出报告：记在该远端上并同步到所有键盘
                    let leds = data[2];
                    remote.ledstate = leds;
                    self.fleet.set_leds_all(leds);
                }
            }
            (ChannelKind::Interrupt, Err(e)) => {
                debug!("{} 中断通道: {e}", remote.addr);
                remote.drop_interrupt();
            }
        }
    }

    /// 入站连接按来源地址挂到对应远端；哪一侧先发起无关紧要，
    /// 两条通道都在位即为已连接
    fn on_inbound(&mut self, kind: ChannelKind, result: io::Result<(SeqPacket, SocketAddr)>) {
        match result {
            Ok((sock, peer)) => {
                let remote = self.registry.get_or_create(peer.addr);
                match kind {
                    ChannelKind::Interrupt => {
                        remote.set_interrupt(sock);
                        info!("INT {} (槽位 {})", peer.addr, remote.index);
                    }
                    ChannelKind::Control => {
                        remote.set_control(sock);
                        info!("CTL {} (槽位 {})", peer.addr, remote.index);
                    }
                }
                self.registry.log_table();
            }
            Err(e) => warn!("接受入站连接失败: {e}"),
        }
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}
