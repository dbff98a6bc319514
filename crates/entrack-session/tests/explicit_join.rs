mod common;

use asupersync::runtime::RuntimeBuilder;
use asupersync::Cx;
use common::{MockExecutor, enrollment_model, tracked_of, unwrap_outcome};
use entrack_core::{EntryOperation, Value};
use entrack_session::{EntityId, EntityState, Session};

fn attached_student_and_course(session: &mut Session) -> (EntityId, EntityId) {
    let student = session.create_entity("Student", &[("Id", Value::BigInt(1))]).unwrap();
    let course = session.create_entity("Course", &[("Id", Value::BigInt(7))]).unwrap();
    session.attach(student).unwrap();
    session.attach(course).unwrap();
    (student, course)
}

#[test]
fn adding_twice_creates_one_enrollment() {
    let mut session = Session::new(enrollment_model());
    let (student, course) = attached_student_and_course(&mut session);

    session.add_to_collection(student, "Courses", course).unwrap();
    session.add_to_collection(student, "Courses", course).unwrap();
    session.add_to_collection(course, "Students", student).unwrap();

    let enrollments = tracked_of(&session, "Enrollment");
    assert_eq!(enrollments.len(), 1);
    let enrollment = enrollments[0];
    assert_eq!(session.state(enrollment), EntityState::Added);
    assert!(session.entry(enrollment).unwrap().has_temporary_key());
    assert_eq!(session.property(enrollment, "StudentId").unwrap(), Value::BigInt(1));
    assert_eq!(session.property(enrollment, "CourseId").unwrap(), Value::BigInt(7));
    assert_eq!(session.entity(course).unwrap().collection("Students").unwrap(), &[student]);
}

#[test]
fn removing_unsaved_enrollment_detaches_it() {
    let mut session = Session::new(enrollment_model());
    let (student, course) = attached_student_and_course(&mut session);
    session.add_to_collection(student, "Courses", course).unwrap();
    let enrollment = tracked_of(&session, "Enrollment")[0];

    session.remove_from_collection(student, "Courses", course).unwrap();

    assert_eq!(session.state(enrollment), EntityState::Detached);
    assert!(tracked_of(&session, "Enrollment").is_empty());
    assert!(session.entity(course).unwrap().collection("Students").unwrap().is_empty());
}

#[test]
fn remove_then_add_restores_enrollment_with_its_payload() {
    let mut session = Session::new(enrollment_model());
    let (student, course) = attached_student_and_course(&mut session);
    session.add_to_collection(student, "Courses", course).unwrap();
    let enrollment = tracked_of(&session, "Enrollment")[0];
    session.set_property(enrollment, "Grade", "A").unwrap();
    session.accept_all_changes().unwrap();

    session.remove_from_collection(course, "Students", student).unwrap();
    assert_eq!(session.state(enrollment), EntityState::Deleted);

    session.add_to_collection(student, "Courses", course).unwrap();
    assert_eq!(session.state(enrollment), EntityState::Unchanged);
    assert_eq!(tracked_of(&session, "Enrollment"), vec![enrollment]);
    assert_eq!(session.property(enrollment, "Grade").unwrap(), Value::from("A"));
    assert_eq!(session.entity(course).unwrap().collection("Students").unwrap(), &[student]);
}

#[test]
fn saving_new_graph_inserts_enrollment_after_both_endpoints() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let executor = MockExecutor::new();

    rt.block_on(async {
        let mut session = Session::new(enrollment_model());
        let student = session.create_entity("Student", &[]).unwrap();
        let course = session.create_entity("Course", &[]).unwrap();
        session.entity_mut(student).unwrap().add_to_collection("Courses", course).unwrap();
        session.add(student).unwrap();
        let enrollment = tracked_of(&session, "Enrollment")[0];

        let saved = unwrap_outcome(session.save_changes(&cx, &executor).await);
        assert_eq!(saved, 3);

        assert_eq!(session.property(student, "Id").unwrap(), Value::BigInt(1000));
        assert_eq!(session.property(course, "Id").unwrap(), Value::BigInt(1001));
        assert_eq!(session.property(enrollment, "Id").unwrap(), Value::BigInt(1002));
        assert_eq!(session.property(enrollment, "StudentId").unwrap(), Value::BigInt(1000));
        assert_eq!(session.property(enrollment, "CourseId").unwrap(), Value::BigInt(1001));
        for id in [student, course, enrollment] {
            assert_eq!(session.state(id), EntityState::Unchanged);
        }
    });

    let state = executor.state.lock().unwrap();
    let types: Vec<&str> = state.saves[0]
        .commands
        .iter()
        .map(|c| c.entity_type.as_str())
        .collect();
    assert_eq!(types, vec!["Student", "Course", "Enrollment"]);
    assert!(state.saves[0]
        .commands
        .iter()
        .all(|c| c.operation == EntryOperation::Insert));
}
