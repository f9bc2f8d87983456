use std::time::Duration;

use crate::exec::{Executor, Signal};

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

#[tokio::test]
async fn wait_returns_exit_code_and_keeps_it() {
    let mut h = Executor::Local
        .start("short", &sh("echo hi; exit 3"), None, false)
        .await
        .unwrap();
    let info = tokio::time::timeout(Duration::from_secs(5), h.wait()).await.unwrap();
    assert_eq!(info.code, Some(3));
    assert!(!info.success());

    // 已退出后再等待立即返回同一结果
    let again = tokio::time::timeout(Duration::from_secs(1), h.wait()).await.unwrap();
    assert_eq!(again, info);
    assert_eq!(h.exit_status(), Some(info));
}

#[tokio::test]
async fn wait_reports_signal() {
    let mut h = Executor::Local
        .start("long", &sh("exec sleep 30"), None, false)
        .await
        .unwrap();
    assert!(h.is_running());
    assert!(h.signal(Signal::Kill));
    let info = tokio::time::timeout(Duration::from_secs(5), h.wait()).await.unwrap();
    assert_eq!(info.code, None);
    assert!(info.signal.is_some());
    assert!(!h.is_running());
}
