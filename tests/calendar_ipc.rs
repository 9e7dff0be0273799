mod common;

use common::{admin, as_actor, root, str_of, Sidecar};
use serde_json::{json, Value};

fn school_with_three_terms(sc: &mut Sidecar) -> (String, String) {
    let created = sc.ok(
        "schools.create",
        as_actor(root(), json!({ "name": "Calendar High", "code": "CAL" })),
    );
    let school_id = str_of(&created, "schoolId").to_string();
    let a = admin(&school_id);
    let session = sc.ok(
        "sessions.create",
        as_actor(
            a.clone(),
            json!({ "name": "2024", "startDate": "2024-01-01", "endDate": "2024-12-31" }),
        ),
    );
    let session_id = str_of(&session, "sessionId").to_string();
    for (name, start, end) in [
        ("First", "2024-01-08", "2024-03-29"),
        ("Second", "2024-04-15", "2024-07-19"),
        ("Third", "2024-09-02", "2024-12-13"),
    ] {
        sc.ok(
            "terms.create",
            as_actor(
                a.clone(),
                json!({ "sessionId": session_id, "name": name, "startDate": start, "endDate": end }),
            ),
        );
    }
    (school_id, session_id)
}

fn statuses(cal: &Value) -> Vec<String> {
    cal["terms"]
        .as_array()
        .expect("terms")
        .iter()
        .map(|t| t["status"].as_str().unwrap_or("").to_string())
        .collect()
}

#[test]
fn session_progress_and_breaks() {
    let mut sc = Sidecar::start();
    let (school_id, session_id) = school_with_three_terms(&mut sc);

    let cal = sc.ok(
        "calendar.session",
        as_actor(
            admin(&school_id),
            json!({ "sessionId": session_id, "asOf": "2024-05-01" }),
        ),
    );
    assert_eq!(cal["totalWeeks"], 53);
    assert_eq!(cal["completedWeeks"], 18);
    assert_eq!(cal["progressPercentage"], 34);
    assert_eq!(cal["status"], "current");

    let breaks = cal["breaks"].as_array().expect("breaks");
    assert_eq!(breaks.len(), 2);
    assert_eq!(breaks[0]["startDate"], "2024-03-30");
    assert_eq!(breaks[0]["endDate"], "2024-04-14");
    assert_eq!(breaks[0]["weeks"], 3);
    assert_eq!(breaks[1]["weeks"], 7);
    assert_eq!(cal["breakWeeks"], 10);
    assert_eq!(cal["academicWeeks"], 43);

    assert_eq!(statuses(&cal), vec!["completed", "current", "upcoming"]);
    assert_eq!(cal["currentTermId"], cal["terms"][1]["id"]);
}

#[test]
fn before_and_after_the_session() {
    let mut sc = Sidecar::start();
    let (school_id, session_id) = school_with_three_terms(&mut sc);
    let a = admin(&school_id);

    let before = sc.ok(
        "calendar.session",
        as_actor(a.clone(), json!({ "sessionId": session_id, "asOf": "2023-12-01" })),
    );
    assert_eq!(before["completedWeeks"], 0);
    assert_eq!(before["progressPercentage"], 0);
    assert_eq!(before["status"], "upcoming");
    assert!(before["currentTermId"].is_null());

    let after = sc.ok(
        "calendar.session",
        as_actor(a.clone(), json!({ "sessionId": session_id, "asOf": "2025-02-01" })),
    );
    assert_eq!(after["completedWeeks"], 53);
    assert_eq!(after["progressPercentage"], 100);
    assert_eq!(statuses(&after), vec!["completed", "completed", "completed"]);

    // Without a sessionId the latest started session is picked.
    let picked = sc.ok(
        "calendar.session",
        as_actor(a, json!({ "asOf": "2025-02-01" })),
    );
    assert_eq!(picked["sessionId"], session_id);
}

#[test]
fn terms_must_fit_the_session_without_overlap() {
    let mut sc = Sidecar::start();
    let (school_id, session_id) = school_with_three_terms(&mut sc);
    let a = admin(&school_id);

    let outside = sc.fail(
        "terms.create",
        as_actor(
            a.clone(),
            json!({ "sessionId": session_id, "name": "Late", "startDate": "2024-12-20", "endDate": "2025-01-10" }),
        ),
    );
    assert_eq!(outside, "bad_params");
    let overlap = sc.fail(
        "terms.create",
        as_actor(
            a.clone(),
            json!({ "sessionId": session_id, "name": "Summer", "startDate": "2024-07-01", "endDate": "2024-08-01" }),
        ),
    );
    assert_eq!(overlap, "bad_params");
    let reversed = sc.fail(
        "sessions.create",
        as_actor(
            a.clone(),
            json!({ "name": "Bad", "startDate": "2025-06-01", "endDate": "2025-01-01" }),
        ),
    );
    assert_eq!(reversed, "bad_params");

    let listed = sc.ok(
        "terms.list",
        as_actor(a.clone(), json!({ "sessionId": session_id, "asOf": "2024-05-01" })),
    );
    let seqs: Vec<i64> = listed["terms"]
        .as_array()
        .expect("terms")
        .iter()
        .map(|t| t["sequence"].as_i64().unwrap_or(0))
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    let dash = sc.ok("dashboard.summary", as_actor(a, json!({ "asOf": "2024-05-01" })));
    assert_eq!(dash["calendar"]["sessionId"], session_id);
    assert_eq!(dash["calendar"]["completedWeeks"], 18);
    assert_eq!(dash["counts"]["students"], 0);
}
