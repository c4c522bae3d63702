//! 以蓝牙地址为节名的 INI 配置存储。
//!
//! 每节可含 `Index`（槽位，落盘一律一号起，方便手工编辑）、
//! `MouseDelayMs`、`MouseSpeed`，缺省项读取时取默认值。

use anyhow::{Context, Result, anyhow};
use configparser::ini::Ini;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MOUSE_DELAY_MS: i64 = 20;

/// 单台远端的持久化设置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteSettings {
    /// 内部使用的零号起槽位，未分配时为 None
    pub index: Option<i32>,
    pub mouse_delay: Duration,
    pub mouse_speed: f32,
}

pub struct ConfigStore {
    path: PathBuf,
    ini: Ini,
}

impl ConfigStore {
    /// 读入存储文件；文件不存在视为空配置
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut ini = Ini::new();
        if path.exists() {
            ini.load(&path)
                .map_err(|e| anyhow!("读取配置 {} 失败: {e}", path.display()))?;
        }
        Ok(Self { path, ini })
    }

    /// 已有配置节的全部地址（规范化小写）
    pub fn addresses(&self) -> Vec<String> {
        self.ini.sections()
    }

    pub fn remote(&self, addr: &str) -> RemoteSettings {
        let delay_ms = self
            .ini
            .getint(addr, "MouseDelayMs")
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_MOUSE_DELAY_MS)
            .max(0);
        RemoteSettings {
            index: self
                .ini
                .getint(addr, "Index")
                .ok()
                .flatten()
                .map(|i| i as i32 - 1),
            mouse_delay: Duration::from_millis(delay_ms as u64),
            mouse_speed: self
                .ini
                .getfloat(addr, "MouseSpeed")
                .ok()
                .flatten()
                .unwrap_or(1.0) as f32,
        }
    }

    /// 记下某地址分配到的槽位并立即落盘；鼠标节流间隔缺省时一并补全
    pub fn assign_index(&mut self, addr: &str, index: i32) -> Result<()> {
        self.ini.set(addr, "Index", Some((index + 1).to_string()));
        if self.ini.get(addr, "MouseDelayMs").is_none() {
            self.ini
                .set(addr, "MouseDelayMs", Some(DEFAULT_MOUSE_DELAY_MS.to_string()));
        }
        self.ini
            .write(&self.path)
            .with_context(|| format!("写入配置 {} 失败", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("keyswitcher-{name}-{}.ini", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn unknown_address_gets_defaults() {
        let store = ConfigStore::load(temp_path("defaults")).unwrap();
        let settings = store.remote("aa:bb:cc:dd:ee:ff");
        assert_eq!(settings.index, None);
        assert_eq!(settings.mouse_delay, Duration::from_millis(20));
        assert_eq!(settings.mouse_speed, 1.0);
    }

    #[test]
    fn assigned_index_round_trips_one_based() {
        let path = temp_path("roundtrip");
        let mut store = ConfigStore::load(&path).unwrap();
        store.assign_index("aa:bb:cc:dd:ee:ff", 3).unwrap();

        // 重新读取：槽位落盘为一号起，读回零号起
        let reread = ConfigStore::load(&path).unwrap();
        let settings = reread.remote("aa:bb:cc:dd:ee:ff");
        assert_eq!(settings.index, Some(3));
        assert_eq!(settings.mouse_delay, Duration::from_millis(20));
        assert_eq!(reread.addresses(), vec!["aa:bb:cc:dd:ee:ff".to_string()]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn tuning_options_are_read_back() {
        let path = temp_path("tuning");
        std::fs::write(
            &path,
            "[aa:bb:cc:dd:ee:ff]\nIndex=2\nMouseDelayMs=5\nMouseSpeed=1.5\n",
        )
        .unwrap();
        let store = ConfigStore::load(&path).unwrap();
        let settings = store.remote("aa:bb:cc:dd:ee:ff");
        assert_eq!(settings.index, Some(1));
        assert_eq!(settings.mouse_delay, Duration::from_millis(5));
        assert_eq!(settings.mouse_speed, 1.5);

        let _ = std::fs::remove_file(&path);
    }
}
