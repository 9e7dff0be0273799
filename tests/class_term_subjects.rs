mod common;

use common::{add_student, admin, as_actor, record_exams, seed_school, str_of, Sidecar};
use serde_json::{json, Value};

fn offered(sc: &mut Sidecar, admin_actor: &Value, class_term_id: &str) -> Vec<(String, Option<String>)> {
    let listed = sc.ok(
        "subjects.list",
        as_actor(admin_actor.clone(), json!({ "classTermId": class_term_id })),
    );
    let mut out: Vec<(String, Option<String>)> = listed["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .map(|s| {
            (
                s["id"].as_str().unwrap_or("").to_string(),
                s["teacherId"].as_str().map(str::to_string),
            )
        })
        .collect();
    out.sort();
    out
}

#[test]
fn set_subjects_reconciles_adds_removals_and_teacher_changes() {
    let mut sc = Sidecar::start();
    let school = seed_school(&mut sc, "SET");
    let a = admin(&school.id);
    let kid = add_student(&mut sc, &school, "Lola", "Ade");
    record_exams(&mut sc, &school, &kid, &[(0, 60.0), (2, 70.0)]);

    let extra = sc.ok("subjects.create", as_actor(a.clone(), json!({ "name": "French" })));
    let french = str_of(&extra, "subjectId").to_string();
    let other_teacher = sc.ok(
        "teachers.create",
        as_actor(a.clone(), json!({ "firstName": "Musa", "lastName": "Bala" })),
    );
    let musa = str_of(&other_teacher, "teacherId").to_string();

    // Keep Math (new teacher), keep English, drop Science, add French.
    let summary = sc.ok(
        "classTerms.setSubjects",
        as_actor(
            a.clone(),
            json!({
                "classTermId": school.class_term_id,
                "subjects": [
                    { "subjectId": school.subjects[0], "teacherId": musa },
                    { "subjectId": school.subjects[1] },
                    { "subjectId": french }
                ]
            }),
        ),
    );
    assert_eq!(summary, json!({ "added": 1, "removed": 1, "updated": 1 }));

    let mut expected = vec![
        (school.subjects[0].clone(), Some(musa.clone())),
        (school.subjects[1].clone(), None),
        (french.clone(), None),
    ];
    expected.sort();
    assert_eq!(offered(&mut sc, &a, &school.class_term_id), expected);

    // Science scores went with the assignment.
    let scores = sc.ok(
        "scores.get",
        as_actor(a.clone(), json!({ "classTermId": school.class_term_id })),
    );
    let subjects: Vec<&str> = scores["entries"]
        .as_array()
        .expect("entries")
        .iter()
        .map(|e| e["subjectId"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(subjects, vec![school.subjects[0].as_str()]);

    // Same list again is a no-op.
    let again = sc.ok(
        "classTerms.setSubjects",
        as_actor(
            a,
            json!({
                "classTermId": school.class_term_id,
                "subjects": [
                    { "subjectId": school.subjects[0], "teacherId": musa },
                    { "subjectId": school.subjects[1] },
                    { "subjectId": french }
                ]
            }),
        ),
    );
    assert_eq!(again, json!({ "added": 0, "removed": 0, "updated": 0 }));
}

#[test]
fn set_subjects_is_all_or_nothing() {
    let mut sc = Sidecar::start();
    let school = seed_school(&mut sc, "AON");
    let foreign = seed_school(&mut sc, "FRN");
    let a = admin(&school.id);
    let before = offered(&mut sc, &a, &school.class_term_id);

    let resp = sc.request(
        "classTerms.setSubjects",
        as_actor(
            a.clone(),
            json!({
                "classTermId": school.class_term_id,
                "subjects": [
                    { "subjectId": school.subjects[0] },
                    { "subjectId": foreign.subjects[0] }
                ]
            }),
        ),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "integrity_violation");
    assert_eq!(resp["error"]["details"]["subjectId"], foreign.subjects[0]);
    assert_eq!(offered(&mut sc, &a, &school.class_term_id), before);

    let code = sc.fail(
        "classTerms.setSubjects",
        as_actor(
            a.clone(),
            json!({
                "classTermId": school.class_term_id,
                "subjects": [
                    { "subjectId": school.subjects[0] },
                    { "subjectId": school.subjects[0] }
                ]
            }),
        ),
    );
    assert_eq!(code, "bad_params");
    assert_eq!(offered(&mut sc, &a, &school.class_term_id), before);
}

#[test]
fn assigned_subjects_cannot_be_deleted() {
    let mut sc = Sidecar::start();
    let school = seed_school(&mut sc, "DEL");
    let a = admin(&school.id);

    let resp = sc.request(
        "subjects.delete",
        as_actor(a.clone(), json!({ "subjectId": school.subjects[2] })),
    );
    assert_eq!(resp["error"]["code"], "integrity_violation");
    assert_eq!(
        resp["error"]["details"]["classTermIds"],
        json!([school.class_term_id])
    );

    sc.ok(
        "classTerms.setSubjects",
        as_actor(
            a.clone(),
            json!({
                "classTermId": school.class_term_id,
                "subjects": [{ "subjectId": school.subjects[0] }, { "subjectId": school.subjects[1] }]
            }),
        ),
    );
    sc.ok(
        "subjects.delete",
        as_actor(a.clone(), json!({ "subjectId": school.subjects[2] })),
    );
    let listed = sc.ok("subjects.list", as_actor(a, json!({})));
    assert_eq!(listed["subjects"].as_array().map(|s| s.len()), Some(2));
}

#[test]
fn opening_a_class_term_twice_returns_the_same_id() {
    let mut sc = Sidecar::start();
    let school = seed_school(&mut sc, "OPN");
    let again = sc.ok(
        "classTerms.open",
        as_actor(
            admin(&school.id),
            json!({ "classId": school.class_id, "termId": school.term_id }),
        ),
    );
    assert_eq!(again["classTermId"], school.class_term_id);
    assert_eq!(again["created"], false);
}
