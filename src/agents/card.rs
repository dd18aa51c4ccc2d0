//! Published agent artifacts
//!
//! The agent card is an A2A-compatible JSON document with additive `nap:`
//! fields; agents serve it at `/.well-known/agent.json`. Hosted agents also
//! get a minimal MCP manifest so chat runtimes can mount them directly.

use serde_json::{json, Value};

use super::model::Agent;

pub fn build_agent_card(agent: &Agent, registry_url: &str, endorsement_jwt: &str) -> Value {
    let skills: Vec<Value> = agent
        .capability_node
        .split('>')
        .enumerate()
        .map(|(i, level)| {
            json!({
                "id": format!("skill-{}", i + 1),
                "name": level,
            })
        })
        .collect();

    json!({
        "name": agent.display_name,
        "description": agent.description,
        "url": agent.endpoint,
        "version": "1.0",
        "capabilities": {
            "streaming": false,
            "pushNotifications": false,
        },
        "skills": skills,
        "nap:uri": agent.uri(),
        "nap:trust_tier": agent.trust_tier().as_str(),
        "nap:registry": registry_url,
        "nap:cert_serial": agent.cert_serial,
        "nap:endorsement": endorsement_jwt,
    })
}

pub fn build_mcp_manifest(agent: &Agent) -> Value {
    json!({
        "schema_version": "v1",
        "name_for_model": agent.agent_id,
        "name_for_human": agent.display_name,
        "description_for_model": agent.description,
        "description_for_human": agent.description,
        "api": {
            "type": "openapi",
            "url": agent.endpoint,
        },
        "capability": agent.capability_node,
    })
}
