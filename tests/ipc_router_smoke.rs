mod common;

use common::{admin, as_actor, root, seed_school, Sidecar};
use serde_json::json;

#[test]
fn requests_before_workspace_select_are_rejected() {
    let mut sc = Sidecar::spawn();
    let health = sc.ok("health", json!({}));
    assert!(health["workspacePath"].is_null());
    assert!(health["version"].is_string());

    let code = sc.fail("schools.list", json!({ "actor": root() }));
    assert_eq!(code, "no_workspace");
    let code = sc.fail("workspace.select", json!({}));
    assert_eq!(code, "bad_params");
}

#[test]
fn malformed_lines_and_unknown_methods() {
    let mut sc = Sidecar::start();
    let resp = sc.send_raw("{not json");
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "bad_json");

    assert_eq!(sc.fail("marksets.list", json!({})), "not_implemented");
    // The loop keeps serving after both.
    sc.ok("health", json!({}));
}

#[test]
fn missing_actor_is_unauthorized() {
    let mut sc = Sidecar::start();
    assert_eq!(sc.fail("schools.list", json!({})), "unauthorized");
    assert_eq!(
        sc.fail("classes.list", json!({ "actor": { "role": "admin" } })),
        "unauthorized"
    );
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let mut sc = Sidecar::start();
    let school = seed_school(&mut sc, "SMK");
    let a = admin(&school.id);

    let every_family = [
        ("schools.list", json!({})),
        ("sessions.list", json!({})),
        ("terms.list", json!({ "sessionId": school.session_id })),
        ("calendar.session", json!({ "sessionId": school.session_id, "asOf": "2024-02-01" })),
        ("classes.list", json!({})),
        ("classTerms.list", json!({ "classId": school.class_id })),
        ("subjects.list", json!({ "classTermId": school.class_term_id })),
        ("teachers.list", json!({})),
        ("students.list", json!({})),
        ("grading.list", json!({})),
        ("grading.get", json!({})),
        ("grading.resolve", json!({ "score": 55 })),
        ("scores.get", json!({ "classTermId": school.class_term_id })),
        ("results.classTerm", json!({ "classTermId": school.class_term_id })),
        ("setup.get", json!({})),
        ("dashboard.summary", json!({ "asOf": "2024-02-01" })),
    ];
    for (method, params) in every_family {
        sc.ok(method, as_actor(a.clone(), params));
    }

    let listed = sc.ok("schools.list", as_actor(root(), json!({})));
    let schools = listed["schools"].as_array().expect("schools");
    assert_eq!(schools.len(), 1);
    assert_eq!(schools[0]["code"], "SMK");
    assert_eq!(schools[0]["classCount"], 1);
}

#[test]
fn tenant_scoping_blocks_other_schools() {
    let mut sc = Sidecar::start();
    let one = seed_school(&mut sc, "ONE");
    let two = seed_school(&mut sc, "TWO");

    let code = sc.fail(
        "results.classTerm",
        as_actor(admin(&one.id), json!({ "classTermId": two.class_term_id })),
    );
    assert_eq!(code, "forbidden");
    let code = sc.fail(
        "classes.list",
        as_actor(admin(&one.id), json!({ "schoolId": two.id })),
    );
    assert_eq!(code, "forbidden");

    // Only the super admin may create or remove schools.
    let code = sc.fail(
        "schools.create",
        as_actor(admin(&one.id), json!({ "name": "Rogue", "code": "RGE" })),
    );
    assert_eq!(code, "unauthorized");
    let code = sc.fail(
        "schools.create",
        as_actor(root(), json!({ "name": "Dup", "code": "one" })),
    );
    assert_eq!(code, "bad_params");

    sc.ok("schools.delete", as_actor(root(), json!({ "schoolId": two.id })));
    let listed = sc.ok("schools.list", as_actor(root(), json!({})));
    assert_eq!(listed["schools"].as_array().map(|s| s.len()), Some(1));
    let code = sc.fail(
        "results.classTerm",
        as_actor(root(), json!({ "classTermId": two.class_term_id })),
    );
    assert_eq!(code, "not_found");
}
