//! Acceptance and rejection suites for the `qb` expression parser.

use chrono::{TimeZone, Utc};
use tresor_query::{
    parse_qb, Condition, ConditionNode, Direction, FieldTransform, LogicOp, MetaSortKey, Operator,
    QbParser, SortSpec,
};

fn leaf(node: &ConditionNode) -> &Condition {
    match node {
        ConditionNode::Leaf(c) => c,
        other => panic!("expected leaf, got {other:?}"),
    }
}

#[test]
fn simple_field_comparison() {
    let query = parse_qb(r#"QB["age"].gt(18)"#).unwrap();
    let cond = leaf(query.conditions.as_ref().unwrap());
    assert_eq!(cond.field_path, "age");
    assert_eq!(cond.operator, Operator::Gt);
    assert_eq!(cond.value, serde_json::Value::from(18));
}

#[test]
fn logical_and_or_not() {
    let query = parse_qb(r#"QB["age"].gt(18) & QB["status"].eq("active")"#).unwrap();
    match query.conditions.unwrap() {
        ConditionNode::Group(g) => {
            assert_eq!(g.logic, LogicOp::And);
            assert_eq!(g.nodes.len(), 2);
        }
        other => panic!("expected group, got {other:?}"),
    }

    let query = parse_qb(r#"QB["a"].eq(1) | ~QB["b"].eq(2)"#).unwrap();
    match query.conditions.unwrap() {
        ConditionNode::Group(g) => {
            assert_eq!(g.logic, LogicOp::Or);
            match &g.nodes[1] {
                ConditionNode::Group(not) => assert_eq!(not.logic, LogicOp::Not),
                other => panic!("expected NOT group, got {other:?}"),
            }
        }
        other => panic!("expected group, got {other:?}"),
    }
}

#[test]
fn comparison_operators() {
    let query = parse_qb(r#"QB["price"] >= 40"#).unwrap();
    let cond = leaf(query.conditions.as_ref().unwrap());
    assert_eq!(cond.operator, Operator::Gte);
    assert_eq!(cond.value, serde_json::Value::from(40));
}

#[test]
fn reversed_comparison_flips_operator() {
    let query = parse_qb(r#"40 <= QB["price"]"#).unwrap();
    let cond = leaf(query.conditions.as_ref().unwrap());
    assert_eq!(cond.operator, Operator::Gte);
    assert_eq!(cond.value, serde_json::Value::from(40));
}

#[test]
fn chained_comparison_ands_both_bounds() {
    let query = parse_qb(r#"18 <= QB["age"] <= 65"#).unwrap();
    match query.conditions.unwrap() {
        ConditionNode::Group(g) => {
            assert_eq!(g.logic, LogicOp::And);
            let lo = leaf(&g.nodes[0]);
            let hi = leaf(&g.nodes[1]);
            assert_eq!((lo.operator, lo.value.clone()), (Operator::Gte, serde_json::Value::from(18)));
            assert_eq!((hi.operator, hi.value.clone()), (Operator::Lte, 65.into()));
        }
        other => panic!("expected group, got {other:?}"),
    }
}

#[test]
fn between_and_length() {
    let query = parse_qb(r#"QB["price"].between(40, 60) & QB["tags"].length() >= 2"#).unwrap();
    match query.conditions.unwrap() {
        ConditionNode::Group(g) => {
            assert_eq!(g.logic, LogicOp::And);
            let length_leaf = leaf(&g.nodes[1]);
            assert_eq!(length_leaf.transform, Some(FieldTransform::Length));
            assert_eq!(length_leaf.operator, Operator::Gte);
        }
        other => panic!("expected group, got {other:?}"),
    }
}

#[test]
fn list_literals_and_in() {
    let query = parse_qb(r#"QB["status"].in_(["active", "pending"])"#).unwrap();
    let cond = leaf(query.conditions.as_ref().unwrap());
    assert_eq!(cond.operator, Operator::InList);
    assert_eq!(cond.value, serde_json::json!(["active", "pending"]));

    let query = parse_qb(r#"QB["status"].not_in([1, -2, 3.5])"#).unwrap();
    let cond = leaf(query.conditions.as_ref().unwrap());
    assert_eq!(cond.operator, Operator::NotInList);
    assert_eq!(cond.value, serde_json::json!([1, -2, 3.5]));
}

#[test]
fn null_and_bool_helpers() {
    let query = parse_qb(r#"QB["email"].is_not_null()"#).unwrap();
    let cond = leaf(query.conditions.as_ref().unwrap());
    assert_eq!(cond.operator, Operator::IsNull);
    assert_eq!(cond.value, serde_json::Value::from(false));

    let query = parse_qb(r#"QB["verified"].is_true()"#).unwrap();
    let cond = leaf(query.conditions.as_ref().unwrap());
    assert_eq!((cond.operator, cond.value.clone()), (Operator::Eq, true.into()));
}

#[test]
fn meta_attribute_access() {
    let query = parse_qb(r#"QB.created_by().eq("admin")"#).unwrap();
    let cond = leaf(query.conditions.as_ref().unwrap());
    assert_eq!(cond.field_path, "created_by");
}

#[test]
fn sort_limit_offset_page_first() {
    let query = parse_qb(
        r#"QB["status"].eq("active").sort(QB["name"].asc(), "-created_time").limit(5).offset(10)"#,
    )
    .unwrap();
    assert_eq!(query.limit, 5);
    assert_eq!(query.offset, 10);
    assert_eq!(
        query.sorts,
        vec![
            SortSpec::Data {
                field_path: "name".into(),
                direction: Direction::Ascending
            },
            SortSpec::Meta {
                key: MetaSortKey::CreatedTime,
                direction: Direction::Descending
            },
        ]
    );

    let query = parse_qb(r#"QB["x"].eq(1).page(2, 25)"#).unwrap();
    assert_eq!(query.offset, 25);
    assert_eq!(query.limit, 25);

    let query = parse_qb(r#"QB["x"].eq(1).first()"#).unwrap();
    assert_eq!(query.limit, 1);
}

#[test]
fn filter_and_exclude() {
    let query = parse_qb(r#"QB["age"].gt(18).filter(QB["status"].eq("active"))"#).unwrap();
    match query.conditions.unwrap() {
        ConditionNode::Group(g) => assert_eq!(g.logic, LogicOp::And),
        other => panic!("expected group, got {other:?}"),
    }

    let query = parse_qb(r#"QB["status"].eq("active").exclude(QB["role"].eq("guest"))"#).unwrap();
    match query.conditions.unwrap() {
        ConditionNode::Group(g) => {
            assert_eq!(g.logic, LogicOp::And);
            match &g.nodes[1] {
                ConditionNode::Group(not) => assert_eq!(not.logic, LogicOp::Not),
                other => panic!("expected NOT group, got {other:?}"),
            }
        }
        other => panic!("expected group, got {other:?}"),
    }
}

#[test]
fn all_any_combinators() {
    let query = parse_qb(r#"QB.all(QB["a"].eq(1), QB["b"].eq(2), QB["c"].eq(3))"#).unwrap();
    match query.conditions.unwrap() {
        ConditionNode::Group(g) => {
            assert_eq!(g.logic, LogicOp::And);
            assert_eq!(g.nodes.len(), 3);
        }
        other => panic!("expected group, got {other:?}"),
    }

    let query = parse_qb(r#"QB.any(QB["s"].eq("draft"), QB["s"].eq("review"))"#).unwrap();
    match query.conditions.unwrap() {
        ConditionNode::Group(g) => assert_eq!(g.logic, LogicOp::Or),
        other => panic!("expected group, got {other:?}"),
    }
}

#[test]
fn date_helpers_use_pinned_clock() {
    let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
    let parser = QbParser::with_now(now);

    let query = parser.parse(r#"QB.created_time().today()"#).unwrap();
    match query.conditions.unwrap() {
        ConditionNode::Group(g) => {
            let start = leaf(&g.nodes[0]).value.as_f64().unwrap();
            let expected = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
            assert_eq!(start, expected.timestamp() as f64);
        }
        other => panic!("expected group, got {other:?}"),
    }

    let query = parser.parse(r#"QB.created_time().last_n_days(7)"#).unwrap();
    let cond = leaf(query.conditions.as_ref().unwrap());
    assert_eq!(cond.operator, Operator::Gte);
    let expected = Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap();
    assert_eq!(cond.value.as_f64().unwrap(), expected.timestamp() as f64);

    // Offset variants accept ints and "+8"-style strings.
    assert!(parser.parse(r#"QB.created_time().today(8)"#).is_ok());
    assert!(parser.parse(r#"QB.created_time().today("+8")"#).is_ok());
    assert!(parser.parse(r#"QB.created_time().today(-4)"#).is_ok());
}

#[test]
fn truthy_field_used_directly() {
    let query = parse_qb(r#"QB["comment"] & QB["status"].eq("open")"#).unwrap();
    match query.conditions.unwrap() {
        ConditionNode::Group(g) => {
            assert_eq!(g.logic, LogicOp::And);
            // First operand is the expanded truthy group for "comment".
            match &g.nodes[0] {
                ConditionNode::Group(truthy) => {
                    assert_eq!(truthy.logic, LogicOp::And);
                    assert_eq!(truthy.nodes.len(), 5);
                }
                other => panic!("expected truthy group, got {other:?}"),
            }
        }
        other => panic!("expected group, got {other:?}"),
    }
}

// Rejection suite: the parser is a security boundary.

#[test]
fn rejects_unknown_methods() {
    for expr in [
        r#"QB["x"].exec("rm -rf /")"#,
        r#"QB["x"].__class__()"#,
        r#"QB["x"].eval("1")"#,
        r#"QB["x"].getattr("y")"#,
    ] {
        assert!(parse_qb(expr).is_err(), "{expr} should be rejected");
    }
}

#[test]
fn rejects_unknown_identifiers() {
    for expr in [
        r#"os.system("id")"#,
        r#"import_os()"#,
        r#"x"#,
        r#"lambda_x"#,
    ] {
        assert!(parse_qb(expr).is_err(), "{expr} should be rejected");
    }
}

#[test]
fn rejects_disallowed_qb_attributes() {
    assert!(parse_qb(r#"QB.internal_state()"#).is_err());
    assert!(parse_qb(r#"QB.schema_version()"#).is_err());
}

#[test]
fn rejects_subscript_on_non_root() {
    assert!(parse_qb(r#"QB["a"]["b"]"#).is_err());
}

#[test]
fn rejects_non_string_subscript() {
    assert!(parse_qb(r#"QB[1]"#).is_err());
}

#[test]
fn rejects_malformed_syntax() {
    for expr in [
        r#"QB["x"].eq("#,
        r#"QB["x".eq(1)"#,
        r#"QB["x"].eq(1) &"#,
        r#"QB["x"] @ 1"#,
        r#"= QB["x"]"#,
        "",
    ] {
        assert!(parse_qb(expr).is_err(), "{expr:?} should be rejected");
    }
}

#[test]
fn rejects_bare_literals_as_query() {
    assert!(parse_qb("42").is_err());
    assert!(parse_qb(r#""hello""#).is_err());
    assert!(parse_qb("[1, 2]").is_err());
}

#[test]
fn rejects_wrong_arity() {
    assert!(parse_qb(r#"QB["x"].eq()"#).is_err());
    assert!(parse_qb(r#"QB["x"].eq(1, 2)"#).is_err());
    assert!(parse_qb(r#"QB["x"].between(1)"#).is_err());
    assert!(parse_qb(r#"QB["x"].length(3)"#).is_err());
}
