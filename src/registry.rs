//! 远端主机登记表：地址/槽位双向索引、连接状态机、报告路由。

use crate::bluetooth::{ChannelKind, Connector, PSM_HID_CONTROL};
use crate::config::{ConfigStore, RemoteSettings};
use crate::input::InputFleet;
use crate::report;
use bluer::Address;
use bluer::l2cap::SeqPacket;
use futures::future::{BoxFuture, select_all};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::time::Duration;

/// 连接状态，由两条通道套接字的在位情况推导
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// `linked` 是历史位：两条通道首次同时在位时置起，全部落空时清掉。
/// 只剩一条通道时靠它区分“正在建立”还是“正在断开”。
fn derive_state(has_control: bool, has_interrupt: bool, linked: bool) -> LinkState {
    match (has_control, has_interrupt) {
        (true, true) => LinkState::Connected,
        (false, false) => LinkState::Disconnected,
        _ if linked => LinkState::Disconnecting,
        _ => LinkState::Connecting,
    }
}

/// 一台已知的远端主机
pub struct Remote {
    pub addr: Address,
    pub index: i32,
    /// 远端最近下发的 LED 位图，切换回来时回放给键盘
    pub ledstate: u8,
    pub mouse_delay: Duration,
    pub mouse_speed: f32,
    csocket: Option<SeqPacket>,
    isocket: Option<SeqPacket>,
    linked: bool,
}

impl Remote {
    fn new(addr: Address, index: i32, settings: RemoteSettings) -> Self {
        Self {
            addr,
            index,
            ledstate: 0,
            mouse_delay: settings.mouse_delay,
            mouse_speed: settings.mouse_speed,
            csocket: None,
            isocket: None,
            linked: false,
        }
    }

    pub fn state(&self) -> LinkState {
        derive_state(self.csocket.is_some(), self.isocket.is_some(), self.linked)
    }

    pub fn set_control(&mut self, sock: SeqPacket) {
        self.csocket = Some(sock);
        self.mark_linked();
    }

    pub fn set_interrupt(&mut self, sock: SeqPacket) {
        self.isocket = Some(sock);
        self.mark_linked();
    }

    fn mark_linked(&mut self) {
        if self.csocket.is_some() && self.isocket.is_some() {
            self.linked = true;
        }
    }

    pub fn drop_control(&mut self) {
        self.csocket = None;
        self.unmark_if_idle();
    }

    pub fn drop_interrupt(&mut self) {
        self.isocket = None;
        self.unmark_if_idle();
    }

    fn unmark_if_idle(&mut self) {
        if self.csocket.is_none() && self.isocket.is_none() {
            self.linked = false;
        }
    }

    /// 经中断通道发送一帧输入报告；失败即丢弃该通道，等下次重连
    pub async fn send_input(&mut self, frame: &[u8]) {
        let Some(sock) = &self.isocket else { return };
        if let Err(e) = sock.send(frame).await {
            error!("向 {} 发送报告失败: {e}", self.addr);
            self.drop_interrupt();
        }
    }

    /// 控制通道上的握手应答
    pub async fn reply_control(&mut self, frame: &[u8]) {
        let Some(sock) = &self.csocket else { return };
        if let Err(e) = sock.send(frame).await {
            debug!("向 {} 应答控制帧失败: {e}", self.addr);
            self.drop_control();
        }
    }
}

/// 登记表本体。远端条目只增不减，套接字随连接来去。
pub struct Registry {
    store: ConfigStore,
    by_index: BTreeMap<i32, Remote>,
    by_addr: HashMap<Address, i32>,
    current: i32,
}

impl Registry {
    /// 启动时为配置里已知的每个地址先建好条目，保证槽位跨重启稳定
    pub fn new(store: ConfigStore) -> Self {
        let mut registry = Self {
            store,
            by_index: BTreeMap::new(),
            by_addr: HashMap::new(),
            current: 0,
        };
        for section in registry.store.addresses() {
            match section.parse::<Address>() {
                Ok(addr) => {
                    registry.get_or_create(addr);
                }
                Err(e) => warn!("配置节 {section} 不是合法蓝牙地址: {e}"),
            }
        }
        registry
    }

    /// 最小空闲槽位；给定的偏好槽位仍空闲时优先用它
    fn alloc_index(&self, preferred: Option<i32>) -> i32 {
        if let Some(p) = preferred {
            if p >= 0 && !self.by_index.contains_key(&p) {
                return p;
            }
        }
        let mut index = 0;
        while self.by_index.contains_key(&index) {
            index += 1;
        }
        index
    }

    /// 取出某地址的条目，第一次见到就地登记并落盘
    pub fn get_or_create(&mut self, addr: Address) -> &mut Remote {
        if !self.by_addr.contains_key(&addr) {
            let section = addr.to_string().to_lowercase();
            let settings = self.store.remote(&section);
            let index = self.alloc_index(settings.index);
            if let Err(e) = self.store.assign_index(&section, index) {
                warn!("持久化 {addr} 的配置失败: {e}");
            }
            info!("登记远端 {addr}，槽位 {index}");
            self.by_addr.insert(addr, index);
            self.by_index.insert(index, Remote::new(addr, index, settings));
        }
        let index = self.by_addr[&addr];
        self.by_index.get_mut(&index).expect("登记表双向索引一致")
    }

    pub fn remote_mut(&mut self, index: i32) -> Option<&mut Remote> {
        self.by_index.get_mut(&index)
    }

    pub fn current_index(&self) -> i32 {
        self.current
    }

    pub fn current(&self) -> Option<&Remote> {
        self.by_index.get(&self.current)
    }

    /// 当前目标的鼠标调校；直通或目标未知时不节流、不加速
    pub fn mouse_tuning(&self) -> (Duration, f32) {
        match self.current() {
            Some(remote) => (remote.mouse_delay, remote.mouse_speed),
            None => (Duration::ZERO, 1.0),
        }
    }

    /// 切换转发目标。顺序要紧：先调整独占，再让旧目标看到全部松开，
    /// 然后换选并回放新目标的 LED，最后对断开的目标补一次出站连接。
    pub async fn set_current(
        &mut self,
        index: i32,
        fleet: &mut InputFleet,
        connector: &mut Connector,
    ) {
        debug!("Setting current to {index}");
        if index != self.current {
            if self.current == -1 {
                fleet.grab_all(true);
            }
            if index == -1 {
                fleet.grab_all(false);
            }
            if let Some(prev) = self.by_index.get_mut(&self.current) {
                prev.send_input(&report::KEYBOARD_RELEASE).await;
                prev.send_input(&report::MOUSE_RELEASE).await;
            }
            self.current = index;
            let leds = self.current().map(|r| r.ledstate).unwrap_or(0);
            fleet.set_leds_all(leds);
        }
        if let Some(remote) = self.current() {
            if remote.state() == LinkState::Disconnected {
                connector.start(remote.addr, PSM_HID_CONTROL);
            }
        }
    }

    /// 把报告转发给当前目标（直通时丢弃）
    pub async fn send_current(&mut self, frame: &[u8]) {
        if let Some(remote) = self.by_index.get_mut(&self.current) {
            remote.send_input(frame).await;
        }
    }

    /// 广播给每一台远端，用于整体释放按键
    pub async fn send_all(&mut self, frame: &[u8]) {
        for remote in self.by_index.values_mut() {
            remote.send_input(frame).await;
        }
    }

    /// 等待任意远端的任意通道到帧；没有在位套接字时永远挂起
    pub async fn next_frame(&self) -> (i32, ChannelKind, io::Result<Vec<u8>>) {
        let mut waits: Vec<BoxFuture<'_, (i32, ChannelKind, io::Result<Vec<u8>>)>> = Vec::new();
        for (&index, remote) in &self.by_index {
            if let Some(sock) = &remote.csocket {
                waits.push(Box::pin(recv_frame(index, ChannelKind::Control, sock)));
            }
            if let Some(sock) = &remote.isocket {
                waits.push(Box::pin(recv_frame(index, ChannelKind::Interrupt, sock)));
            }
        }
        if waits.is_empty() {
            std::future::pending::<()>().await;
        }
        select_all(waits).await.0
    }

    /// 设备表一览，入站连接建立时打一遍
    pub fn log_table(&self) {
        info!("------");
        for (index, remote) in &self.by_index {
            info!(
                "{}{}: {} {:?}",
                if *index == self.current { '*' } else { ' ' },
                index,
                remote.addr,
                remote.state()
            );
        }
    }
}

async fn recv_frame(
    index: i32,
    kind: ChannelKind,
    sock: &SeqPacket,
) -> (i32, ChannelKind, io::Result<Vec<u8>>) {
    let mut buf = vec![0u8; 1024];
    match sock.recv(&mut buf).await {
        Ok(n) => {
            buf.truncate(n);
            (index, kind, Ok(buf))
        }
        Err(e) => (index, kind, Err(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> ConfigStore {
        let mut path = std::env::temp_dir();
        path.push(format!("keyswitcher-registry-{name}-{}.ini", std::process::id()));
        let _ = std::fs::remove_file(&path);
        ConfigStore::load(path).unwrap()
    }

    fn addr(last: u8) -> Address {
        Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
    }

    #[test]
    fn state_is_derived_from_socket_presence() {
        assert_eq!(derive_state(false, false, false), LinkState::Disconnected);
        assert_eq!(derive_state(true, false, false), LinkState::Connecting);
        assert_eq!(derive_state(false, true, false), LinkState::Connecting);
        assert_eq!(derive_state(true, true, false), LinkState::Connected);
        assert_eq!(derive_state(true, true, true), LinkState::Connected);
        // 历史位把“只剩一条通道”判成正在断开
        assert_eq!(derive_state(true, false, true), LinkState::Disconnecting);
        assert_eq!(derive_state(false, true, true), LinkState::Disconnecting);
        assert_eq!(derive_state(false, false, true), LinkState::Disconnected);
    }

    #[test]
    fn indices_allocate_smallest_free_and_never_collide() {
        let mut registry = Registry::new(temp_store("alloc"));
        let i0 = registry.get_or_create(addr(0x01)).index;
        let i1 = registry.get_or_create(addr(0x02)).index;
        let i2 = registry.get_or_create(addr(0x03)).index;
        assert_eq!((i0, i1, i2), (0, 1, 2));

        // 重复登记拿回同一条目
        assert_eq!(registry.get_or_create(addr(0x02)).index, 1);
        assert_eq!(registry.by_index.len(), 3);
        assert_eq!(registry.by_addr.len(), 3);
    }

    #[test]
    fn persisted_index_is_preferred_at_startup() {
        let mut path = std::env::temp_dir();
        path.push(format!("keyswitcher-registry-pref-{}.ini", std::process::id()));
        std::fs::write(
            &path,
            "[aa:bb:cc:dd:ee:07]\nIndex=4\n[aa:bb:cc:dd:ee:08]\nIndex=4\n",
        )
        .unwrap();

        let registry = Registry::new(ConfigStore::load(&path).unwrap());
        let mut indices: Vec<i32> = registry.by_index.keys().copied().collect();
        indices.sort_unstable();
        // 第一个拿到偏好槽位 3，冲突的第二个退到最小空闲槽位
        assert_eq!(indices, vec![0, 3]);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn reselecting_disconnected_target_kicks_connect() {
        let mut registry = Registry::new(temp_store("kick"));
        let index = registry.get_or_create(addr(0x11)).index;
        let mut fleet = InputFleet::default();
        let mut connector = Connector::default();

        registry.set_current(index, &mut fleet, &mut connector).await;
        assert_eq!(registry.current_index(), index);
        assert!(!connector.is_idle());
    }

    #[tokio::test]
    async fn passthrough_never_connects() {
        let mut registry = Registry::new(temp_store("passthrough"));
        registry.get_or_create(addr(0x21));
        let mut fleet = InputFleet::default();
        let mut connector = Connector::default();

        registry.set_current(-1, &mut fleet, &mut connector).await;
        assert_eq!(registry.current_index(), -1);
        assert!(registry.current().is_none());
        assert!(connector.is_idle());

        // 直通下鼠标不节流
        assert_eq!(registry.mouse_tuning(), (Duration::ZERO, 1.0));
    }

    #[test]
    fn tuning_follows_current_remote() {
        let mut registry = Registry::new(temp_store("tuning"));
        registry.get_or_create(addr(0x31));
        assert_eq!(registry.mouse_tuning().0, Duration::from_millis(20));
    }
}
