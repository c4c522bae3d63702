//! 输入设备管理：枚举、热插拔、独占、事件解码。
//!
//! 一个 `event<N>` 节点按其 udev 属性可以同时产生键盘和鼠标两个
//! 独立条目，各自维护自己的报告状态。

use crate::hotkey::{self, Action};
use crate::keymap;
use crate::report::{KeyboardReport, MouseReport};
use evdev::{Device, EventStream, EventType, InputEvent, KeyCode, LedCode, RelativeAxisCode};
use log::{debug, error, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;

/// 一次事件解码的产物
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Nothing,
    /// 完整的线缆格式 HID 报告，交给注册表转发
    Report(Vec<u8>),
    /// 命中热键，本次报告被吞掉
    Hotkey(Action),
}

/// 设备通道变体，承载各自的报告状态
pub enum Channel {
    Keyboard(KeyboardReport),
    Mouse(MouseReport),
}

pub struct InputEntry {
    node: PathBuf,
    channel: Channel,
    stream: EventStream,
}

impl InputEntry {
    fn open(node: &Path, channel: Channel, grab: bool) -> io::Result<Self> {
        let mut device = Device::open(node)?;
        if grab {
            // 同一节点的第二个通道可能已经独占，EBUSY 可容忍
            if let Err(e) = device.grab() {
                warn!("独占 {} 失败: {e}", node.display());
            }
        }
        let name = device.name().unwrap_or("?").to_string();
        let mut entry = Self {
            node: node.to_path_buf(),
            channel,
            stream: device.into_event_stream()?,
        };
        if matches!(entry.channel, Channel::Keyboard(_)) {
            // 新接入的键盘先熄灭全部指示灯
            entry.set_leds(0);
        }
        info!("Connected {}@{} ({name})", entry.kind_name(), node.display());
        Ok(entry)
    }

    fn kind_name(&self) -> &'static str {
        match self.channel {
            Channel::Keyboard(_) => "KeyboardInput",
            Channel::Mouse(_) => "MouseInput",
        }
    }

    /// 把 LED 位图（bit0..4 = NumLock..Kana）写给键盘，鼠标通道忽略
    pub fn set_leds(&mut self, leds: u8) {
        if !matches!(self.channel, Channel::Keyboard(_)) {
            return;
        }
        let led = |code: LedCode, bit: u8| {
            InputEvent::new(EventType::LED.0, code.0, (leds & bit != 0) as i32)
        };
        let events = [
            led(LedCode::LED_NUML, 0x01),
            led(LedCode::LED_CAPSL, 0x02),
            led(LedCode::LED_SCROLLL, 0x04),
            led(LedCode::LED_COMPOSE, 0x08),
            led(LedCode::LED_KANA, 0x10),
        ];
        if let Err(e) = self.stream.device_mut().send_events(&events) {
            warn!("写入 {} 的 LED 失败: {e}", self.node.display());
        }
    }

    fn set_grab(&mut self, on: bool) {
        let device = self.stream.device_mut();
        let result = if on { device.grab() } else { device.ungrab() };
        if let Err(e) = result {
            debug!("{} {} 失败: {e}", if on { "独占" } else { "释放" }, self.node.display());
        }
    }

    fn handle(&mut self, event: &InputEvent, delay: Duration, speed: f32) -> Decoded {
        match &mut self.channel {
            Channel::Keyboard(report) => decode_key(report, event),
            Channel::Mouse(report) => decode_mouse(report, event, delay, speed, Instant::now()),
        }
    }
}

/// 键盘通道：EV_KEY → 10 字节报告或热键动作。
/// 热键只在“按下前六个槽位全空”的那次按下时成立，命中则吞掉本次报告；
/// 对应的松开照常发出。
fn decode_key(report: &mut KeyboardReport, event: &InputEvent) -> Decoded {
    if event.event_type() != EventType::KEY || event.value() > 1 {
        return Decoded::Nothing; // 自动重复交给远端处理
    }
    let key = KeyCode::new(event.code());
    let pressed = event.value() == 1;

    if let Some(bit) = keymap::modifier_bit(key) {
        report.set_modifier(bit, pressed);
        return Decoded::Report(report.to_wire().to_vec());
    }

    let Some(usage) = keymap::usage(key) else {
        warn!("Unknown evdev key code {}", event.code());
        return Decoded::Nothing;
    };

    let combo = (pressed && report.idle())
        .then(|| (report.modifiers() as u16) << 8 | usage as u16);
    if pressed {
        report.press(usage);
    } else {
        report.release(usage);
    }
    if let Some(action) = combo.and_then(hotkey::lookup) {
        return Decoded::Hotkey(action);
    }
    Decoded::Report(report.to_wire().to_vec())
}

/// 鼠标通道：EV_REL 累积位移，EV_KEY 维护按键位图，EV_SYN 是发送边界
fn decode_mouse(
    report: &mut MouseReport,
    event: &InputEvent,
    delay: Duration,
    speed: f32,
    now: Instant,
) -> Decoded {
    match event.event_type() {
        EventType::KEY => {
            if event.value() > 1 {
                return Decoded::Nothing;
            }
            let bit = match KeyCode::new(event.code()) {
                KeyCode::BTN_LEFT => 0x01,
                KeyCode::BTN_RIGHT => 0x02,
                KeyCode::BTN_MIDDLE => 0x04,
                KeyCode::BTN_SIDE => 0x08,
                KeyCode::BTN_EXTRA => 0x10,
                _ => return Decoded::Nothing,
            };
            report.set_button(bit, event.value() == 1);
            Decoded::Nothing
        }
        EventType::RELATIVE => {
            match RelativeAxisCode(event.code()) {
                RelativeAxisCode::REL_X => report.add_x(event.value()),
                RelativeAxisCode::REL_Y => report.add_y(event.value()),
                RelativeAxisCode::REL_WHEEL => report.add_wheel(event.value()),
                _ => {}
            }
            Decoded::Nothing
        }
        EventType::SYNCHRONIZATION => {
            if !report.due(delay, now) {
                return Decoded::Nothing;
            }
            Decoded::Report(report.build(speed, now).to_vec())
        }
        _ => Decoded::Nothing,
    }
}

/// 当前接入的全部输入设备
#[derive(Default)]
pub struct InputFleet {
    entries: Vec<InputEntry>,
}

impl InputFleet {
    /// 启动时扫描 input 子系统下已存在的设备
    pub fn scan(&mut self, grab: bool) -> anyhow::Result<()> {
        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem("input")?;
        for device in enumerator.scan_devices()? {
            self.add_udev(&device, grab);
        }
        Ok(())
    }

    fn add_udev(&mut self, device: &udev::Device, grab: bool) {
        let Some(node) = device.devnode() else { return };
        if !is_event_node(node) {
            return;
        }
        self.add_node(
            node,
            device.property_value("ID_INPUT_KEY").is_some(),
            device.property_value("ID_INPUT_MOUSE").is_some(),
            grab,
        );
    }

    /// 按属性为节点建立键盘/鼠标通道；两个属性都有则建两个
    pub fn add_node(&mut self, node: &Path, keyboard: bool, mouse: bool, grab: bool) {
        if self.entries.iter().any(|e| e.node == node) {
            return;
        }
        if keyboard {
            match InputEntry::open(node, Channel::Keyboard(KeyboardReport::default()), grab) {
                Ok(entry) => self.entries.push(entry),
                Err(e) => error!("Failed to connect to {}: {e}", node.display()),
            }
        }
        if mouse {
            match InputEntry::open(node, Channel::Mouse(MouseReport::default()), grab) {
                Ok(entry) => self.entries.push(entry),
                Err(e) => error!("Failed to connect to {}: {e}", node.display()),
            }
        }
    }

    /// 摘掉一个节点的全部通道
    pub fn remove_node(&mut self, node: &Path) {
        let before = self.entries.len();
        self.entries.retain(|e| e.node != node);
        if self.entries.len() != before {
            info!("Disconnected {}", node.display());
        }
    }

    pub fn node_of(&self, slot: usize) -> Option<PathBuf> {
        self.entries.get(slot).map(|e| e.node.clone())
    }

    pub fn grab_all(&mut self, on: bool) {
        if on {
            debug!("Grabbing all input devices");
        } else {
            debug!("Releasing all input devices");
        }
        for entry in &mut self.entries {
            entry.set_grab(on);
        }
    }

    pub fn set_leds_all(&mut self, leds: u8) {
        for entry in &mut self.entries {
            entry.set_leds(leds);
        }
    }

    pub fn decode(&mut self, slot: usize, event: &InputEvent, delay: Duration, speed: f32) -> Decoded {
        match self.entries.get_mut(slot) {
            Some(entry) => entry.handle(event, delay, speed),
            None => Decoded::Nothing,
        }
    }

    /// 等待任意输入设备产生下一条内核事件；没有设备时永远挂起
    pub async fn next_event(&mut self) -> (usize, io::Result<InputEvent>) {
        if self.entries.is_empty() {
            std::future::pending::<()>().await;
        }
        let waits = self
            .entries
            .iter_mut()
            .enumerate()
            .map(|(slot, entry)| {
                Box::pin(async move { (slot, entry.stream.next_event().await) })
            })
            .collect::<Vec<_>>();
        futures::future::select_all(waits).await.0
    }
}

fn is_event_node(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix("event"))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// 热插拔动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    Add,
    Remove,
}

/// 一条与输入节点相关的热插拔变化
pub struct HotplugChange {
    pub action: HotplugAction,
    pub node: PathBuf,
    pub keyboard: bool,
    pub mouse: bool,
}

/// udev netlink 监视器，订阅 input 子系统的增删事件
pub struct HotplugMonitor {
    fd: AsyncFd<udev::MonitorSocket>,
}

impl HotplugMonitor {
    pub fn new() -> anyhow::Result<Self> {
        let socket = udev::MonitorBuilder::new()?
            .match_subsystem("input")?
            .listen()?;
        Ok(Self {
            fd: AsyncFd::new(socket)?,
        })
    }

    /// 等待下一条与 event 节点相关的增删事件
    pub async fn next_change(&mut self) -> io::Result<HotplugChange> {
        loop {
            let mut guard = self.fd.readable_mut().await?;
            while let Some(event) = guard.get_inner_mut().iter().next() {
                let action = match event.event_type() {
                    udev::EventType::Add => HotplugAction::Add,
                    udev::EventType::Remove => HotplugAction::Remove,
                    _ => continue,
                };
                let device = event.device();
                let Some(node) = device.devnode() else { continue };
                if !is_event_node(node) {
                    continue;
                }
                return Ok(HotplugChange {
                    action,
                    node: node.to_path_buf(),
                    keyboard: device.property_value("ID_INPUT_KEY").is_some(),
                    mouse: device.property_value("ID_INPUT_MOUSE").is_some(),
                });
            }
            guard.clear_ready();
        }
    }
}
