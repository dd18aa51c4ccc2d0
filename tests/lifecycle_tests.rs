//! End-to-end lifecycle scenarios over the HTTP surface: hosted and domain
//! registration, verification gates, trust tiers, quotas, and resolution.

mod common;

use common::{base_url, boot, boot_with, serve};
use nap_registry::config::RegistryRole;
use serde_json::{json, Value};

fn agent_id_matches_grammar(id: &str) -> bool {
    id.strip_prefix("agent_")
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| matches!(c, 'a'..='z' | '2'..='7')))
        .unwrap_or(false)
}

#[tokio::test]
async fn hosted_registration_happy_path() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    let base = base_url(addr);

    let resp = http
        .post(format!("{base}/api/v1/agents"))
        .json(&json!({
            "registration_type": "hosted",
            "owner_user": "alice",
            "owner_email": "alice@example.com",
            "capability": "assistant",
            "display_name": "X",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let agent: Value = resp.json().await.unwrap();
    assert_eq!(agent["trust_root"], "nap");
    assert_eq!(agent["status"], "pending");
    assert_eq!(agent["trust_tier"], "unverified");
    let agent_id = agent["agent_id"].as_str().unwrap().to_string();
    assert!(agent_id_matches_grammar(&agent_id), "bad id: {agent_id}");

    // Activation is gated on the confirmed email.
    let resp = http
        .post(format!("{base}/api/v1/agents/{agent_id}/activate"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["kind"], "email_not_verified");

    t.emails.mark_verified("alice").await;
    let resp = http
        .post(format!("{base}/api/v1/agents/{agent_id}/activate"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let bundle: Value = resp.json().await.unwrap();
    assert_eq!(bundle["agent"]["status"], "active");
    assert_eq!(bundle["trust_tier"], "basic");
    assert_eq!(bundle["uri"], format!("agent://nap/assistant/{agent_id}"));
    assert!(bundle["private_key_pem"]
        .as_str()
        .unwrap()
        .contains("PRIVATE KEY"));
    assert!(bundle["ca_pem"].as_str().unwrap().contains("CERTIFICATE"));
    assert!(bundle["endorsement_jwt"].as_str().unwrap().contains('.'));
    assert!(bundle["mcp_manifest"].is_object());

    // Hosted leaf: one email SAN, zero DNS SANs, one agent URI SAN.
    let (uris, dns, emails, uri_values) =
        common::san_counts(bundle["cert_pem"].as_str().unwrap());
    assert_eq!((uris, dns, emails), (1, 0, 1));
    assert_eq!(uri_values[0], format!("agent://nap/assistant/{agent_id}"));

    // And it resolves.
    let resp = http
        .get(format!(
            "{base}/api/v1/resolve?trust_root=nap&cap_node=assistant&agent_id={agent_id}"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resolved: Value = resp.json().await.unwrap();
    assert_eq!(resolved["trust_tier"], "basic");
    assert_eq!(resolved["registry_url"], "https://registry.test");
}

#[tokio::test]
async fn domain_registration_gated_by_dns01() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    let base = base_url(addr);

    let resp = http
        .post(format!("{base}/api/v1/agents"))
        .json(&json!({
            "registration_type": "domain",
            "owner_domain": "acme.com",
            "capability": "finance>accounting",
            "endpoint": "https://agents.acme.com/reconciler",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let agent: Value = resp.json().await.unwrap();
    let agent_id = agent["agent_id"].as_str().unwrap().to_string();
    assert_eq!(agent["trust_root"], "acme.com");

    // No verified challenge yet.
    let resp = http
        .post(format!("{base}/api/v1/agents/{agent_id}/activate"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["kind"], "domain_not_verified");

    // DNS-01: start, publish the TXT record, verify.
    let resp = http
        .post(format!("{base}/api/v1/dns/challenge"))
        .json(&json!({ "domain": "acme.com" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let challenge: Value = resp.json().await.unwrap();
    let challenge_id = challenge["id"].as_str().unwrap();
    let txt_host = challenge["txt_host"].as_str().unwrap();
    let txt_value = challenge["txt_value"].as_str().unwrap();
    assert_eq!(txt_host, "_nap-challenge.acme.com");
    assert!(txt_value.starts_with("nap-challenge="));

    // Verify before the record is visible: 422.
    let resp = http
        .post(format!("{base}/api/v1/dns/challenge/{challenge_id}/verify"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    t.txt.set(txt_host, vec![txt_value.to_string()]).await;
    let resp = http
        .post(format!("{base}/api/v1/dns/challenge/{challenge_id}/verify"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let verified: Value = resp.json().await.unwrap();
    assert_eq!(verified["verified"], true);

    let resp = http
        .post(format!("{base}/api/v1/agents/{agent_id}/activate"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let bundle: Value = resp.json().await.unwrap();
    assert_eq!(bundle["trust_tier"], "trusted");
    assert_eq!(bundle["uri"], format!("agent://acme.com/finance/{agent_id}"));

    // Domain leaf: one DNS SAN, zero email SANs.
    let (uris, dns, emails, _) = common::san_counts(bundle["cert_pem"].as_str().unwrap());
    assert_eq!((uris, dns, emails), (1, 1, 0));

    // Located by its top-level category despite the two-level node.
    let resp = http
        .get(format!(
            "{base}/api/v1/resolve?trust_root=acme.com&cap_node=finance&agent_id={agent_id}"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resolved: Value = resp.json().await.unwrap();
    assert_eq!(resolved["capability_node"], "finance>accounting");
}

#[tokio::test]
async fn hosted_path_rejects_caller_supplied_trust_root() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/v1/agents", base_url(addr)))
        .json(&json!({
            "registration_type": "hosted",
            "owner_user": "mallory",
            "trust_root": "acme.com",
            "capability": "assistant",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn reserved_trust_roots_are_rejected_on_the_domain_path() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    for domain in ["nap", "registry.test"] {
        let resp = http
            .post(format!("{}/api/v1/agents", base_url(addr)))
            .json(&json!({
                "registration_type": "domain",
                "owner_domain": domain,
                "capability": "assistant",
                "endpoint": "https://x.example",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "domain {domain} should be reserved");
    }
}

#[tokio::test]
async fn hosted_quota_is_enforced() {
    let t = boot_with(RegistryRole::Standalone, |c| {
        c.limits.hosted_agent_quota = 2;
    })
    .await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    let base = base_url(addr);

    for i in 0..2 {
        let resp = http
            .post(format!("{base}/api/v1/agents"))
            .json(&json!({
                "registration_type": "hosted",
                "owner_user": "bob",
                "capability": format!("assistant-{i}"),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
    }
    let resp = http
        .post(format!("{base}/api/v1/agents"))
        .json(&json!({
            "registration_type": "hosted",
            "owner_user": "bob",
            "capability": "assistant-2",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["kind"], "quota_exceeded");
}

#[tokio::test]
async fn revocation_is_terminal_and_hides_the_agent() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    let base = base_url(addr);

    t.emails.mark_verified("carol").await;
    let agent: Value = http
        .post(format!("{base}/api/v1/agents"))
        .json(&json!({
            "registration_type": "hosted",
            "owner_user": "carol",
            "capability": "search",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let agent_id = agent["agent_id"].as_str().unwrap().to_string();
    http.post(format!("{base}/api/v1/agents/{agent_id}/activate"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    // Owner session token authorises the revoke.
    let session = t
        .registry
        .tokens
        .issue_session_token("carol", "carol@example.com", "carol", "user", None)
        .unwrap();
    let resp = http
        .post(format!("{base}/api/v1/agents/{agent_id}/revoke"))
        .bearer_auth(&session)
        .json(&json!({ "reason": "compromised key" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let revoked: Value = resp.json().await.unwrap();
    assert_eq!(revoked["status"], "revoked");
    assert_eq!(revoked["trust_tier"], "unverified");

    // Gone from resolution, and no way back.
    let resp = http
        .get(format!(
            "{base}/api/v1/resolve?trust_root=nap&cap_node=search&agent_id={agent_id}"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let resp = http
        .post(format!("{base}/api/v1/agents/{agent_id}/activate"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn concurrent_activations_pick_one_winner() {
    let t = boot(RegistryRole::Standalone).await;
    t.emails.mark_verified("dave").await;
    let agent = t
        .registry
        .agents
        .register(serde_json::from_value(json!({
            "registration_type": "hosted",
            "owner_user": "dave",
            "capability": "assistant",
        })).unwrap())
        .await
        .unwrap();

    let service = t.registry.agents.clone();
    let id_a = agent.agent_id.clone();
    let id_b = agent.agent_id.clone();
    let service_b = service.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { service.activate(&id_a).await }),
        tokio::spawn(async move { service_b.activate(&id_b).await }),
    );
    let results = [a.unwrap(), b.unwrap()];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one activation may succeed");
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(nap_registry::RegistryError::Conflict(_)))));
}

#[tokio::test]
async fn threat_scorer_blocks_risky_registrations() {
    use common::{FixedScore, StubEmails, StubTxt};
    use nap_registry::Registry;
    use std::sync::Arc;

    let dir = tempfile::TempDir::new().unwrap();
    let config = common::test_config(dir.path(), "registry.db");
    let registry = Registry::bootstrap(
        config,
        StubTxt::new(),
        StubEmails::new(),
        Some(Arc::new(FixedScore(90))),
    )
    .await
    .unwrap();

    let err = registry
        .agents
        .register(serde_json::from_value(json!({
            "registration_type": "hosted",
            "owner_user": "eve",
            "capability": "assistant",
        })).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, nap_registry::RegistryError::Forbidden(_)));
}
