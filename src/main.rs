use clap::Parser;
use keyswitcher::engine::Engine;
use std::path::PathBuf;

/// 把本机键鼠经蓝牙 HID 转发给多台远端主机的切换器
#[derive(Parser)]
struct Args {
    /// 远端设置的 INI 存储路径
    #[arg(long, default_value = "keyswitcher.ini")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // 默认 info，RUST_LOG 可覆盖。循环单线程地按序处理事件，
    // 毫秒时间戳就够对出节流与目标切换的先后关系。
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .format_module_path(true)
        .init();

    let args = Args::parse();

    // 绑定 L2CAP PSM 17/19、独占 evdev、写 LED 都要特权
    if unsafe { libc::geteuid() } != 0 {
        anyhow::bail!("需要 root 权限运行");
    }

    let engine = Engine::new(args.config).await?;
    engine.run().await
}
