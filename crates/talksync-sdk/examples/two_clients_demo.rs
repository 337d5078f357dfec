//! 双端实时同步演示
//!
//! 两个 SDK 实例共享同一个内存平台：alice 发送、bob 实时收到。
//! 未读计数、输入状态、表情反馈全程由推送与事件流驱动。

use std::sync::Arc;
use talksync_sdk::platform::memory::MemoryPlatform;
use talksync_sdk::{
    MessageContent, NewConversation, RemotePlatform, SortMode, TalksyncConfig, TalksyncSdk,
};
use tokio::time::{sleep, Duration};

fn render(content: &MessageContent) -> String {
    match content {
        MessageContent::Text { body } => body.clone(),
        MessageContent::Image { name, .. } => format!("[图片 {}]", name),
        MessageContent::Document { name, .. } => format!("[文件 {}]", name),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🚀 双端实时同步演示");
    println!("====================================\n");

    // 共享内存平台：注册两人并建一个单聊
    let platform = MemoryPlatform::new();
    let alice = platform.register_user("alice", Some("alice@example.com"));
    let bob = platform.register_user("bob", Some("bob@example.com"));
    let conversation = platform
        .create_conversation(NewConversation {
            name: None,
            is_group: false,
            created_by: alice,
            member_ids: vec![alice, bob],
        })
        .await?;

    // 各自登录、各起一个 SDK 实例
    platform.sign_in(alice);
    let alice_sdk =
        TalksyncSdk::initialize(Arc::new(platform.clone()), TalksyncConfig::default()).await?;
    alice_sdk.connect().await?;

    platform.sign_in(bob);
    let bob_sdk =
        TalksyncSdk::initialize(Arc::new(platform.clone()), TalksyncConfig::default()).await?;
    bob_sdk.connect().await?;
    println!("✅ 两端均已连接\n");

    // bob 打开会话，订阅事件流
    bob_sdk.select_conversation(Some(conversation.id)).await?;
    let mut bob_events = bob_sdk.subscribe_events();

    // alice 打开会话并开始输入
    alice_sdk.select_conversation(Some(conversation.id)).await?;
    alice_sdk.signal_typing(conversation.id).await?;
    sleep(Duration::from_millis(100)).await;
    println!(
        "⌨️  bob 看到正在输入的用户: {:?}",
        bob_sdk.typing_users(conversation.id)
    );

    // alice 发送
    let provisional_id = alice_sdk.send_text(conversation.id, "Hello Bob!").await?;
    println!("📤 alice 已发送（临时 ID {}）", provisional_id);
    sleep(Duration::from_millis(100)).await;

    println!("\n📥 bob 的时间线:");
    for message in bob_sdk.timeline() {
        println!(
            "   [{}] {}: {}",
            message.id,
            message.sender_username(),
            render(&message.content)
        );
    }

    // bob 给这条消息一个表情反馈
    let message_id = bob_sdk.timeline()[0].id;
    bob_sdk.add_reaction(conversation.id, message_id, "👍").await?;
    println!(
        "👍 bob 已表态，消息上的反馈: {:?}",
        bob_sdk.timeline()[0].reactions
    );

    // alice 退出会话视图后，bob 的回复计入未读
    alice_sdk.select_conversation(None).await?;
    bob_sdk.send_text(conversation.id, "Hi Alice!").await?;
    sleep(Duration::from_millis(100)).await;

    let list = alice_sdk.conversations(SortMode::Recency);
    println!(
        "\n🔔 alice 侧会话 \"{}\" 未读数: {}",
        list[0].display_name(alice),
        list[0].unread_count
    );

    println!("\n📋 bob 收到的事件:");
    while let Ok(event) = bob_events.try_recv() {
        println!("   - {}", event.event_type());
    }

    alice_sdk.shutdown().await;
    bob_sdk.shutdown().await;
    println!("\n✅ 演示结束");
    Ok(())
}
