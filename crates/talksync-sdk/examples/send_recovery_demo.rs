//! 发送失败与通道恢复演示
//!
//! 前半段注入一次写入失败：乐观条目进入 Failed、通知板张贴提示，
//! `retry_send` 复用同一 client_tag 收敛到权威行。
//! 后半段掐断推送通道，观察订阅管理器按指数退避自动重建。

use std::sync::Arc;
use talksync_sdk::platform::memory::MemoryPlatform;
use talksync_sdk::{
    DeliveryState, NewConversation, RemotePlatform, TalksyncConfig, TalksyncSdk,
};
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("\n🚀 发送失败与通道恢复演示");
    println!("====================================\n");

    let platform = MemoryPlatform::new();
    let user = platform.register_user("alice", Some("alice@example.com"));
    let conversation = platform
        .create_conversation(NewConversation {
            name: Some("notes".to_string()),
            is_group: true,
            created_by: user,
            member_ids: vec![user],
        })
        .await?;
    platform.sign_in(user);

    let sdk = TalksyncSdk::initialize(Arc::new(platform.clone()), TalksyncConfig::default()).await?;
    sdk.connect().await?;
    sdk.select_conversation(Some(conversation.id)).await?;

    // === 第一幕：写入失败 → Failed → 重试收敛 ===
    println!("【第一幕】注入一次写入失败");
    platform.fail_next_insert();
    let provisional_id = sdk.send_text(conversation.id, "重要笔记").await?;
    sleep(Duration::from_millis(50)).await;

    let entry = sdk.timeline()[0].clone();
    println!("   条目状态: {:?}（临时 ID {}）", entry.delivery, entry.id);
    for notice in sdk.active_notices() {
        println!("   📢 通知: {}", notice.text);
    }
    assert_eq!(entry.delivery, DeliveryState::Failed);

    println!("   ▶ 重试发送…");
    sdk.retry_send(conversation.id, provisional_id).await?;
    sleep(Duration::from_millis(50)).await;

    let entry = sdk.timeline()[0].clone();
    println!(
        "   条目状态: {:?}（权威 ID {}）\n",
        entry.delivery, entry.id
    );
    assert_eq!(entry.delivery, DeliveryState::Delivered);

    // === 第二幕：推送通道断开 → 指数退避自动重建 ===
    println!("【第二幕】掐断推送通道");
    platform.break_channels();
    sleep(Duration::from_millis(50)).await;
    println!("   订阅状态: {:?}", sdk.subscription_state());

    println!("   ▶ 等待自动重建（首次退避 1 秒）…");
    sleep(Duration::from_millis(1200)).await;
    println!("   订阅状态: {:?}", sdk.subscription_state());
    println!("   活跃通道数: {}", platform.live_channel_count());

    sdk.shutdown().await;
    println!("\n✅ 演示结束");
    Ok(())
}
