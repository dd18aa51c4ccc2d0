//! Token lifetimes and ledger integrity, exercised end to end.

mod common;

use common::{base_url, boot, serve};
use nap_registry::config::RegistryRole;
use serde_json::{json, Value};

#[tokio::test]
async fn task_tokens_expire_and_reject_tampering() {
    let t = boot(RegistryRole::Standalone).await;
    let tokens = &t.registry.tokens;

    let short = tokens
        .issue_task_token(
            "agent://nap/assistant/agent_x",
            vec!["resolve".into()],
            Some(chrono::Duration::seconds(1)),
        )
        .unwrap();
    assert!(tokens.verify_task_token(&short).is_ok());

    // Past `exp` (zero leeway) the same token is refused.
    tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
    assert!(tokens.verify_task_token(&short).is_err());

    // A fresh token dies from one flipped signature character.
    let token = tokens
        .issue_task_token("agent://nap/assistant/agent_x", vec![], None)
        .unwrap();
    let mut tampered = token.into_bytes();
    let last = tampered.len() - 1;
    tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
    let tampered = String::from_utf8(tampered).unwrap();
    assert!(tokens.verify_task_token(&tampered).is_err());
}

#[tokio::test]
async fn endorsements_round_trip_with_tier_and_serial() {
    let t = boot(RegistryRole::Standalone).await;
    t.emails.mark_verified("frank").await;
    let agent = t
        .registry
        .agents
        .register(
            serde_json::from_value(json!({
                "registration_type": "hosted",
                "owner_user": "frank",
                "capability": "assistant",
            }))
            .unwrap(),
        )
        .await
        .unwrap();
    let bundle = t.registry.agents.activate(&agent.agent_id).await.unwrap();

    let claims = t
        .registry
        .tokens
        .verify_endorsement(&bundle.endorsement_jwt)
        .unwrap();
    assert_eq!(claims.sub, bundle.uri);
    assert_eq!(claims.trust_tier, "basic");
    assert_eq!(
        Some(claims.cert_serial.as_str()),
        bundle.agent.cert_serial.as_deref()
    );
    assert_eq!(claims.registry_url, "https://registry.test");

    // The activation bundle's task token verifies too.
    let task = t.registry.tokens.verify_task_token(&bundle.task_jwt).unwrap();
    assert_eq!(task.sub, bundle.uri);
}

#[tokio::test]
async fn ledger_records_lifecycle_and_detects_tampering() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    let base = base_url(addr);

    for i in 0..10 {
        t.registry
            .agents
            .register(
                serde_json::from_value(json!({
                    "registration_type": "hosted",
                    "owner_user": format!("user-{i}"),
                    "capability": "assistant",
                }))
                .unwrap(),
            )
            .await
            .unwrap();
    }

    // Genesis + 10 register events, all linked.
    let resp = http
        .get(format!("{base}/api/v1/ledger/verify"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let verdict: Value = resp.json().await.unwrap();
    assert_eq!(verdict["chain"]["status"], "valid");
    assert_eq!(verdict["chain"]["entries"], 11);
    assert_eq!(verdict["root"].as_str().unwrap().len(), 64);

    let entry: Value = http
        .get(format!("{base}/api/v1/ledger/entries/5"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(entry["index"], 5);
    assert_eq!(entry["action"], "register");

    let listed: Value = http
        .get(format!("{base}/api/v1/ledger?limit=100"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 11);

    // Flip a byte in entry 5 behind the ledger's back.
    sqlx::query("UPDATE ledger_entries SET payload = ? WHERE idx = 5")
        .bind(r#"{"registration_type":"domain","capability":"assistant"}"#)
        .execute(&t.registry.pool)
        .await
        .unwrap();
    let verdict: Value = http
        .get(format!("{base}/api/v1/ledger/verify"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(verdict["chain"]["status"], "mismatch");
    assert_eq!(verdict["chain"]["index"], 5);

    // Read endpoints stay available despite the broken chain.
    let resp = http
        .get(format!("{base}/api/v1/ledger/entries/3"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn ledger_failures_do_not_fail_business_operations() {
    let t = boot(RegistryRole::Standalone).await;
    // Sabotage the ledger storage entirely.
    sqlx::query("DROP TABLE ledger_entries")
        .execute(&t.registry.pool)
        .await
        .unwrap();

    // Registration still succeeds; the append failure is logged and dropped.
    let agent = t
        .registry
        .agents
        .register(
            serde_json::from_value(json!({
                "registration_type": "hosted",
                "owner_user": "grace",
                "capability": "assistant",
            }))
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(agent.trust_root, "nap");
}
