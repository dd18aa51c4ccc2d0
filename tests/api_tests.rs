//! HTTP surface behaviour: discovery documents, authorisation, error
//! mapping, list filters.

mod common;

use common::{base_url, boot, serve};
use nap_registry::config::RegistryRole;
use serde_json::{json, Value};

async fn hosted_agent(t: &common::TestRegistry, owner: &str, capability: &str) -> String {
    t.emails.mark_verified(owner).await;
    let agent = t
        .registry
        .agents
        .register(
            serde_json::from_value(json!({
                "registration_type": "hosted",
                "owner_user": owner,
                "capability": capability,
            }))
            .unwrap(),
        )
        .await
        .unwrap();
    agent.agent_id
}

#[tokio::test]
async fn discovery_documents_are_served() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    let base = base_url(addr);

    let health: Value = http
        .get(format!("{base}/healthz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let jwks: Value = http
        .get(format!("{base}/.well-known/jwks.json"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let keys = jwks["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kty"], "RSA");
    assert_eq!(keys[0]["alg"], "RS256");

    let oidc: Value = http
        .get(format!("{base}/.well-known/openid-configuration"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        oidc["jwks_uri"],
        "https://registry.test/.well-known/jwks.json"
    );
}

#[tokio::test]
async fn mutating_routes_enforce_ownership_and_roles() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    let base = base_url(addr);

    let agent_id = hosted_agent(&t, "henry", "assistant").await;
    let owner = t
        .registry
        .tokens
        .issue_session_token("henry", "henry@example.com", "henry", "user", None)
        .unwrap();
    let stranger = t
        .registry
        .tokens
        .issue_session_token("iris", "iris@example.com", "iris", "user", None)
        .unwrap();
    let admin = t
        .registry
        .tokens
        .issue_session_token("root-1", "admin@registry.test", "admin", "admin", None)
        .unwrap();

    // PATCH: no token, wrong owner, owner.
    let patch = json!({ "display_name": "Renamed" });
    let url = format!("{base}/api/v1/agents/{agent_id}");
    assert_eq!(
        http.patch(&url).json(&patch).send().await.unwrap().status(),
        401
    );
    assert_eq!(
        http.patch(&url)
            .bearer_auth(&stranger)
            .json(&patch)
            .send()
            .await
            .unwrap()
            .status(),
        403
    );
    let updated: Value = http
        .patch(&url)
        .bearer_auth(&owner)
        .json(&patch)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["display_name"], "Renamed");
    // The natural key did not move.
    assert_eq!(updated["trust_root"], "nap");
    assert_eq!(updated["agent_id"], agent_id);

    // DELETE: admin only.
    assert_eq!(http.delete(&url).send().await.unwrap().status(), 401);
    assert_eq!(
        http.delete(&url)
            .bearer_auth(&owner)
            .send()
            .await
            .unwrap()
            .status(),
        403
    );
    assert_eq!(
        http.delete(&url)
            .bearer_auth(&admin)
            .send()
            .await
            .unwrap()
            .status(),
        204
    );
    assert_eq!(http.get(&url).send().await.unwrap().status(), 404);

    // A task token is not a session token.
    let task = t
        .registry
        .tokens
        .issue_task_token("agent://nap/assistant/agent_x", vec![], None)
        .unwrap();
    let other_id = hosted_agent(&t, "henry", "search").await;
    assert_eq!(
        http.delete(format!("{base}/api/v1/agents/{other_id}"))
            .bearer_auth(&task)
            .send()
            .await
            .unwrap()
            .status(),
        401
    );
}

#[tokio::test]
async fn federation_routes_need_admin_and_root_role() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    let base = base_url(addr);

    // Standalone still carries the federation service; listing without a
    // token is unauthorised.
    assert_eq!(
        http.get(format!("{base}/api/v1/federation/registries"))
            .send()
            .await
            .unwrap()
            .status(),
        401
    );
}

#[tokio::test]
async fn expired_challenges_return_410() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    let base = base_url(addr);

    let challenge: Value = http
        .post(format!("{base}/api/v1/dns/challenge"))
        .json(&json!({ "domain": "slow.example" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = challenge["id"].as_str().unwrap();

    sqlx::query("UPDATE dns_challenges SET expires_at = ? WHERE id = ?")
        .bind(chrono::Utc::now() - chrono::Duration::minutes(20))
        .bind(id)
        .execute(&t.registry.pool)
        .await
        .unwrap();

    let resp = http
        .post(format!("{base}/api/v1/dns/challenge/{id}/verify"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 410);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["kind"], "expired");
}

#[tokio::test]
async fn list_filters_by_root_capability_prefix_and_status() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    let base = base_url(addr);

    let a = hosted_agent(&t, "judy", "finance>accounting>reconciliation").await;
    let _b = hosted_agent(&t, "judy", "finance>reporting").await;
    let _c = hosted_agent(&t, "judy", "search").await;
    t.registry.agents.activate(&a).await.unwrap();

    let finance: Value = http
        .get(format!("{base}/api/v1/agents?capability_node=finance"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(finance.as_array().unwrap().len(), 2);

    let narrow: Value = http
        .get(format!(
            "{base}/api/v1/agents?capability_node=finance%3Eaccounting"
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(narrow.as_array().unwrap().len(), 1);

    let active: Value = http
        .get(format!("{base}/api/v1/agents?trust_root=nap&status=active"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let active = active.as_array().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["agent_id"], a);

    // Unknown status strings are a validation error.
    assert_eq!(
        http.get(format!("{base}/api/v1/agents?status=bogus"))
            .send()
            .await
            .unwrap()
            .status(),
        400
    );
}

#[tokio::test]
async fn unknown_resources_map_to_404() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    let base = base_url(addr);

    for path in [
        "/api/v1/agents/agent_missing234",
        "/api/v1/dns/challenge/no-such-id",
        "/api/v1/ledger/entries/999",
    ] {
        let resp = http.get(format!("{base}{path}")).send().await.unwrap();
        assert_eq!(resp.status(), 404, "{path}");
        let err: Value = resp.json().await.unwrap();
        assert_eq!(err["kind"], "not_found", "{path}");
    }
}

#[tokio::test]
async fn agent_card_is_published_with_nap_fields() {
    let t = boot(RegistryRole::Standalone).await;
    let addr = serve(&t.registry).await;
    let http = reqwest::Client::new();
    let base = base_url(addr);

    let agent_id = hosted_agent(&t, "kate", "assistant").await;
    t.registry.agents.activate(&agent_id).await.unwrap();

    let card: Value = http
        .get(format!("{base}/api/v1/agents/{agent_id}/card"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(card["nap:trust_tier"], "basic");
    assert_eq!(card["nap:registry"], "https://registry.test");
    assert_eq!(card["nap:uri"], format!("agent://nap/assistant/{agent_id}"));
    let endorsement = card["nap:endorsement"].as_str().unwrap();
    let claims = t.registry.tokens.verify_endorsement(endorsement).unwrap();
    assert_eq!(claims.sub, card["nap:uri"].as_str().unwrap());
}
