//! 自身在线状态与资料生命周期
//!
//! 登录后保证资料行存在（缺失时用邮箱前缀建默认资料），
//! 状态随连接生命周期流转：connect 置 Online，shutdown 尽力置 Offline。
//! 所有变更写远端后经由资料推送流扇回本地状态，这里不直接改状态树。

use crate::entities::{PresenceStatus, Profile};
use crate::error::Result;
use crate::platform::{AuthSession, ProfilePatch, RemotePlatform};
use crate::utils::time::now_millis;
use std::sync::Arc;
use tracing::{info, warn};

/// 缺失资料时的默认用户名：邮箱 @ 前的本地部分，或 "user-{id}"
fn default_username(session: &AuthSession) -> String {
    session
        .email
        .as_deref()
        .and_then(|email| email.split('@').next())
        .filter(|local| !local.is_empty())
        .map(|local| local.to_string())
        .unwrap_or_else(|| format!("user-{}", session.user_id))
}

/// 自身资料管理
#[derive(Clone)]
pub struct OwnPresence {
    platform: Arc<dyn RemotePlatform>,
    user_id: u64,
}

impl OwnPresence {
    pub fn new(platform: Arc<dyn RemotePlatform>, user_id: u64) -> Self {
        Self { platform, user_id }
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    /// 保证会话用户的资料行存在，返回当前资料
    ///
    /// 首次登录没有资料行：按邮箱本地部分建默认资料，
    /// `has_completed_setup = false`，由嵌入方引导补全。
    pub async fn ensure_profile(
        platform: &Arc<dyn RemotePlatform>,
        session: &AuthSession,
    ) -> Result<Profile> {
        if let Some(profile) = platform.fetch_profile(session.user_id).await? {
            return Ok(profile);
        }

        let username = default_username(session);
        info!(
            "creating default profile: user_id={} username={}",
            session.user_id, username
        );
        let profile = Profile {
            id: session.user_id,
            username,
            email: session.email.clone(),
            avatar_url: None,
            status: PresenceStatus::Offline,
            last_seen: None,
            has_completed_setup: false,
        };
        platform.create_profile(profile).await
    }

    /// 设置自身状态；同时刷新 last_seen
    pub async fn set_status(&self, status: PresenceStatus) -> Result<Profile> {
        self.platform
            .update_profile(ProfilePatch {
                user_id: self.user_id,
                status: Some(status),
                last_seen: Some(now_millis()),
                ..Default::default()
            })
            .await
    }

    /// 完成首次资料设置
    pub async fn complete_setup(
        &self,
        username: String,
        avatar_url: Option<String>,
    ) -> Result<Profile> {
        self.platform
            .update_profile(ProfilePatch {
                user_id: self.user_id,
                username: Some(username),
                avatar_url,
                has_completed_setup: Some(true),
                ..Default::default()
            })
            .await
    }

    /// 下线前尽力置 Offline，失败只记日志
    pub async fn set_offline_best_effort(&self) {
        if let Err(e) = self.set_status(PresenceStatus::Offline).await {
            warn!("failed to set offline status: {}", e);
        }
    }
}
