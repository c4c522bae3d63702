//! 需要真实蓝牙控制器和 root 权限的联机测试，默认忽略。

use keyswitcher::bluetooth::{self, ChannelKind};
use keyswitcher::config::ConfigStore;
use keyswitcher::registry::{LinkState, Registry};
use std::time::Duration;

#[tokio::test(flavor = "current_thread")]
#[ignore]
async fn test_live_inbound_pairing() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let session = bluer::Session::new().await.unwrap();
    let (adapter, _profile) = bluetooth::setup_adapter(&session).await.unwrap();
    let (control_listener, interrupt_listener) = bluetooth::bind_listeners().unwrap();
    bluetooth::enter_pairable(&adapter).await;

    let mut registry = Registry::new(
        ConfigStore::load(std::env::temp_dir().join("keyswitcher-live.ini")).unwrap(),
    );

    println!("--------------------------------------------------");
    println!("请在远端主机的蓝牙设置中搜索并连接 'Pi Keyboard/Mouse'");
    println!("你有 60 秒时间完成配对...");
    println!("--------------------------------------------------");

    let wait_both = async {
        let mut got = Vec::new();
        while got.len() < 2 {
            tokio::select! {
                Ok((sock, peer)) = control_listener.accept() => {
                    registry.get_or_create(peer.addr).set_control(sock);
                    got.push(ChannelKind::Control);
                    println!("控制通道(PSM 17)已连接: {}", peer.addr);
                }
                Ok((sock, peer)) = interrupt_listener.accept() => {
                    registry.get_or_create(peer.addr).set_interrupt(sock);
                    got.push(ChannelKind::Interrupt);
                    println!("中断通道(PSM 19)已连接: {}", peer.addr);
                }
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(60), wait_both)
        .await
        .is_err()
    {
        panic!("等待远端连接超时");
    }

    registry.log_table();
    let current = registry.current().expect("应有已连接的远端");
    assert_eq!(current.state(), LinkState::Connected);

    // 远端应看到按下又松开的 'a'
    registry
        .send_current(&[0xA1, 0x01, 0x00, 0x00, 0x04, 0, 0, 0, 0, 0])
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    registry
        .send_current(&[0xA1, 0x01, 0x00, 0x00, 0x00, 0, 0, 0, 0, 0])
        .await;
    println!("'a' 键按下并松开完成。");
}
