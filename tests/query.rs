use vantage::VantageError;
use vantage::config::Settings;
use vantage::datatype::ValueType;
use vantage::persist::Cell;
use vantage::session::Session;

fn seeded() -> Session {
    let session = Session::local(&Settings::default()).expect("session");
    for i in 0..20 {
        session.pack("step", ValueType::Integer32, i).expect("pack");
        if i % 2 == 0 {
            session.pack("even", ValueType::String, format!("e{i}")).expect("pack");
        }
        session.publish().expect("publish");
    }
    session
}

#[test]
fn rowid_filter_limits_rows() {
    let session = seeded();
    let result = session.query("select * from tblvals where rowid < 11").expect("query");
    assert_eq!(result.len(), 10);
    for column in ["row_id", "pub_guid", "frame", "time_send", "time_recv", "step", "even"] {
        assert!(result.column_index(column).is_some(), "missing {column}");
    }
}

#[test]
fn order_limit_offset() {
    let session = seeded();
    let result = session
        .query("SELECT step FROM tblVals ORDER BY step DESC LIMIT 3 OFFSET 1;")
        .expect("query");
    assert_eq!(result.columns, vec!["step"]);
    assert_eq!(result.rows, vec![
        vec![Cell::Integer(18)],
        vec![Cell::Integer(17)],
        vec![Cell::Integer(16)],
    ]);
}

#[test]
fn boolean_filters_and_nulls() {
    let session = seeded();
    let odd = session.query("select step from tblvals where even is null").expect("query");
    assert_eq!(odd.len(), 10);
    let some = session
        .query("select step from tblvals where (step >= 10 and even is not null) or step = 1 order by step")
        .expect("query");
    let steps: Vec<_> = some.rows.iter().map(|r| r[0].clone()).collect();
    assert_eq!(steps, vec![
        Cell::Integer(1),
        Cell::Integer(10),
        Cell::Integer(12),
        Cell::Integer(14),
        Cell::Integer(16),
        Cell::Integer(18),
    ]);
    let named = session.query("select step from tblvals where even = 'e4'").expect("query");
    assert_eq!(named.rows, vec![vec![Cell::Integer(4)]]);
    let negated = session.query("select step from tblvals where not step <> 3").expect("query");
    assert_eq!(negated.rows, vec![vec![Cell::Integer(3)]]);
}

#[test]
fn syntax_and_execution_errors_are_distinct() {
    let session = seeded();
    for sql in [
        "delete from tblvals",
        "select * from tblvals; select * from tblpubs",
        "select max(step) from tblvals",
        "select * from tblvals where step in (1, 2)",
    ] {
        assert!(matches!(session.query(sql), Err(VantageError::QuerySyntax(_))), "{sql}");
    }
    match session.query("select nothing from tblvals") {
        Err(VantageError::QueryExecution(message)) => assert!(message.contains("nothing")),
        other => panic!("expected execution error, got {other:?}"),
    }
    assert!(matches!(
        session.query("select * from tblmissing"),
        Err(VantageError::QueryExecution(_))
    ));
    // the session stays usable after a failed query
    assert_eq!(session.query("select * from tblpubs").expect("query").len(), 1);
}
