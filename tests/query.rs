//! End-to-end query scenarios: matching, apply, projection and execution.

#[macro_use]
extern crate lazy_static;

use quince::prelude::*;
use serde_json::{ json, Value };

fn doc(value: &Value) -> BinDoc {
    BinDoc::from_json(value).expect("document encodes")
}

fn matched(value: &Value, query: &str) -> bool {
    let mut q = Query::new(Some("c1"), query).expect("query compiles");
    q.matched(&doc(value)).expect("matching succeeds")
}

fn check(value: &Value, query: &str, expected: bool) {
    assert_eq!(matched(value, query), expected,
               "query `{}` against {}", query, value);
}

fn shaped(value: &Value, query: &str) -> Value {
    let d = doc(value);
    let mut q = Query::new(Some("c1"), query).expect("query compiles");
    assert!(q.matched(&d).expect("matching succeeds"));
    q.apply_and_project(&d)
        .expect("apply/project succeeds")
        .expect("query has an apply or projection clause")
}

lazy_static! {
    static ref NESTED: Value = json!({
        "foo": {
            "bar": { "baz": { "zaz": 33 } },
            "sas": { "gaz": { "zaz": 44, "zarr": [42] } },
            "arr": [1, 2, 3, 4],
        }
    });
}

#[test]
fn wildcard_roots_match_everything() {
    check(&json!({}), "/*", true);
    check(&json!({}), "/**", true);
    check(&json!({ "foo": { "bar": 22 } }), "/*", true);
    check(&json!({ "foo": { "bar": 22 } }), "/**", true);
}

#[test]
fn field_paths() {
    let d = json!({ "foo": { "bar": 22 } });
    check(&d, "/foo/bar", true);
    check(&d, "/foo/baz", false);
    check(&json!({ "foo": { "bar": 22, "bar2": "vvv2" } }), "/foo/bar2", true);
    check(&json!({ "f": 22 }), "/f", true);
    check(&json!({ "a": "bar" }), "/f | asc /f", false);
}

#[test]
fn logical_joins() {
    let d = json!({ "foo": { "bar": 22 } });
    check(&d, "/foo/bar and /foo/bar or /foo", true);
    check(&d, "/foo/baz or /foo", true);
    check(&d, "/foo/baz and (/foo/daz or /foo/bar)", false);
    check(&d, "(/boo or /foo) and (/foo/daz or /foo/bar)", true);
    check(&d, "/foo/bar and not /foo/baz", true);
    check(&d, "/foo/bar and not /foo", false);
}

#[test]
fn comparison_operators() {
    let d = json!({ "foo": { "bar": 22 } });
    check(&d, "/foo/[bar = 22]", true);
    check(&d, "/foo/[bar eq 22]", true);
    check(&d, "/foo/[bar !eq 22]", false);
    check(&d, "/foo/[bar != 22]", false);
    check(&d, "/foo/[bar >= 22]", true);
    check(&d, "/*/[bar >= 22]", true);
    check(&d, "/foo/[bar > 21]", true);
    check(&d, "/foo/[bar > 22]", false);
    check(&d, "/foo/[bar < 23]", true);
    check(&d, "/foo/[bar <= 22]", true);
    check(&d, "/foo/[bar < 22]", false);
    check(&d, "/*/[bar < 22]", false);
}

#[test]
fn compound_predicates() {
    let d = json!({ "foo": { "bar": 22 } });
    check(&d, "/*/[bar > 20 and bar <= 23]", true);
    check(&d, "/*/[bar > 22 and bar <= 23]", false);
    check(&d, "/*/[bar > 23 or bar < 23]", true);
    check(&d, "/*/[bar < 23 or bar > 23]", true);
}

#[test]
fn conjuncts_may_match_at_different_keys() {
    let d = json!({ "box": { "w": 3, "h": 4 } });
    check(&d, "/box/[w = 3 and h = 4]", true);
    check(&d, "/box/[w = 3 and h = 5]", false);
}

#[test]
fn key_expression_predicates() {
    let d = json!({ "foo": { "bar": 22 } });
    check(&d, "/foo/[[* = bar] = 22]", true);
    check(&d, "/foo/[[* = bar] != 23]", true);
    check(&d, "/[* = foo]/[[* = bar] != 23]", true);
    check(&d, "/[* != foo]/[[* = bar] != 23]", false);
}

#[test]
fn regex_operator() {
    let d = json!({ "foo": { "bar": 22 } });
    check(&d, "/[* re \"foo\"]", true);
    check(&d, "/[* re fo]", true);
    check(&d, "/[* re ^foo$]", true);
    check(&d, "/[* re ^fo$]", false);
    check(&d, "/[* not re ^fo$]", true);
    check(&d, "/foo/[bar re 22]", true);
    check(&d, "/foo/[bar re \"2+\"]", true);
}

#[test]
fn prefix_operator() {
    let d = json!({ "name": "quince tree" });
    check(&d, "/[name ~ quince]", true);
    check(&d, "/[name ~ peach]", false);
    check(&d, "/[name not ~ peach]", true);
}

#[test]
fn membership_operators() {
    let d = json!({ "foo": { "bar": 22 } });
    check(&d, "/foo/[bar in [21, \"22\"]]", true);
    check(&d, "/foo/[bar in [21, 23]]", false);
    check(&d, "/[* in [\"foo\"]]/[bar in [21, 22]]", true);
    check(&d, "/[* not in [\"foo\"]]/[bar in [21, 22]]", false);

    let tags = json!({ "tags": ["bar", "foo"] });
    check(&tags, "/tags/[** in [\"bar\", \"baz\"]]", true);
    check(&tags, "/tags/[** in [\"zaz\", \"gaz\"]]", false);
}

#[test]
fn any_depth_wildcards() {
    let d = json!({ "foo": { "bar": 22 } });
    check(&d, "/**", true);
    check(&d, "/**/bar", true);
    check(&d, "/**/baz", false);
    check(&d, "/**/**/bar", true);

    let deeper = json!({ "foo": { "bar": 22, "baz": { "zaz": 33 } } });
    check(&deeper, "/foo/**/zaz", true);
    check(&deeper, "/foo/**/[zaz > 30]", true);
    check(&deeper, "/foo/**/[zaz < 30]", false);
}

#[test]
fn container_equality() {
    check(&json!({ "foo": [1, 2] }), "/[foo = [1,2]]", true);
    check(&json!({ "foo": [1, 2] }), "/[foo ni 2]", true);
    check(&json!({ "foo": [1, 2] }), "/[foo in [[1,2]]]", true);

    let d = json!({ "foo": { "arr": [1, 2, 3, 4] } });
    check(&d, "/foo/[arr = [1,2,3,4]]", true);
    check(&d, "/foo/**/[arr = [1,2,3,4]]", true);
    check(&d, "/foo/*/[arr = [1,2,3,4]]", false);
    check(&d, "/foo/[arr = [1,2,3]]", false);
    check(&d, "/foo/[arr = [1,12,3,4]]", false);

    let obj = json!({ "foo": { "obj": { "f": "d", "e": "j" } } });
    check(&obj, "/foo/[obj = {\"e\":\"j\",\"f\":\"d\"}]", true);
    check(&obj, "/foo/[obj = {\"e\":\"j\",\"f\":\"dd\"}]", false);
}

#[test]
fn primary_key_filters() {
    check(&json!({ "f": 22 }), "/=22", true);
    check(&json!({ "f": 22 }), "@mycoll/=22", true);
}

#[test]
fn nested_document_walks() {
    check(&NESTED, "/foo/sas/gaz/zaz", true);
    check(&NESTED, "/foo/sas/gaz/[zaz = 44]", true);
    check(&NESTED, "/**/[zaz = 44]", true);
    check(&NESTED, "/foo/**/[zaz = 44]", true);
    check(&NESTED, "/foo/*/*/[zaz = 44]", true);
    check(&NESTED, "/foo/[arr ni 3]", true);
    check(&NESTED, "/**/[zarr ni 42]", true);
    check(&NESTED, "/**/[[* in [\"zarr\"]] in [[42]]]", true);
}

#[test]
fn apply_patch_and_merge() {
    assert_eq!(
        shaped(&json!({ "foo": { "bar": 22 } }),
               "/foo/bar | apply [{\"op\":\"add\", \"path\":\"/baz\", \"value\":\"qux\"}]"),
        json!({ "foo": { "bar": 22 }, "baz": "qux" })
    );
    assert_eq!(
        shaped(&json!({ "foo": { "bar": 22 } }),
               "/foo/bar | apply {\"baz\":\"qux\"}"),
        json!({ "foo": { "bar": 22 }, "baz": "qux" })
    );
}

#[test]
fn apply_merge_commutes_on_disjoint_keys() {
    let one = shaped(&json!({ "k": 0 }), "/* | apply {\"a\": 1}");
    let two = shaped(&BinDoc::from_json(&one).unwrap().to_json().unwrap(),
                     "/* | apply {\"b\": 2}");
    let both = shaped(&json!({ "k": 0 }), "/* | apply {\"a\": 1, \"b\": 2}");
    assert_eq!(two, both);
}

#[test]
fn projections() {
    let d = json!({ "foo": { "bar": 22, "baz": { "gaz": 444, "zaz": 555 } } });
    assert_eq!(
        shaped(&d, "/** | /foo/bar + /foo/baz/zaz"),
        json!({ "foo": { "bar": 22, "baz": { "zaz": 555 } } })
    );
    assert_eq!(
        shaped(&d, "/** | /foo/bar + /foo/baz/zaz - /*/bar"),
        json!({ "foo": { "baz": { "zaz": 555 } } })
    );
    assert_eq!(
        shaped(&json!({ "foo": { "bar": 22 }, "name": "t" }), "/** | all - /name"),
        json!({ "foo": { "bar": 22 } })
    );
    assert_eq!(shaped(&json!({ "foo": 1 }), "/** | /zzz"), json!({}));
}

#[test]
fn projection_with_placeholders() {
    let d = doc(&json!({ "foo": 1, "bar": 2, "baz": 3 }));
    let mut q = Query::new(Some("c1"), "/* | /:name+/:?").unwrap();

    assert_eq!(q.set_i64(0_usize, 1).unwrap_err().kind(),
               QuinceErrorKind::InvalidPlaceholderValueType);

    q.set_str("name", "foo").unwrap();
    q.set_str(0_usize, "baz").unwrap();

    assert!(q.matched(&d).unwrap());
    assert!(q.has_projection());
    let out = q.apply_and_project(&d).unwrap().unwrap();
    assert_eq!(serde_json::to_string(&out).unwrap(), "{\"foo\":1,\"baz\":3}");
}

#[test]
fn regex_placeholders_precompile() {
    let d = json!({ "name": "quince" });
    let mut q = Query::new(Some("c1"), "/[name re :rx]").unwrap();
    assert_eq!(q.set_regex("rx", "[qu").unwrap_err().kind(),
               QuinceErrorKind::RegexpCharset);
    q.set_regex("rx", "qui").unwrap();
    assert!(q.matched(&doc(&d)).unwrap());
}

#[test]
fn scientific_notation_in_apply() {
    let q = Query::new(Some("c1"), "/* | apply {\"pr\":2.2E1,\"b\":1}").unwrap();
    assert!(q.has_apply());
}

#[test]
fn bindoc_round_trip_property() {
    for value in &[
        json!({}),
        json!({ "a": null, "b": true, "c": false }),
        json!({ "n": 0, "m": -1, "big": 5_000_000_000_i64, "f": 0.5 }),
        json!({ "s": "", "t": "text", "u": "ünïcode" }),
        json!([1, [2, [3, [4]]]]),
        json!({ "deep": { "deeper": { "deepest": [{ "k": "v" }] } } }),
    ] {
        assert_eq!(&BinDoc::from_json(value).unwrap().to_json().unwrap(), value);
    }
}

#[test]
fn matching_is_repeatable_across_documents() {
    // One query instance, many documents: per-document state resets must
    // not leak matches from one document into the next.
    let mut q = Query::new(Some("c1"), "/foo/[bar = 22]").unwrap();
    let yes = doc(&json!({ "foo": { "bar": 22 } }));
    let no = doc(&json!({ "foo": { "bar": 23 } }));
    for _ in 0..3 {
        assert!(q.matched(&yes).unwrap());
        assert!(!q.matched(&no).unwrap());
    }
}

#[test]
fn corrupt_documents_do_not_match() {
    let good = doc(&json!({ "foo": { "bar": 22 } }));
    let mut bytes = good.as_bytes().to_vec();
    // Clobber the type byte of the innermost value.
    let tainted = bytes.len() - 2;
    bytes[tainted] = 0xEE;
    let view = BinView::new(&bytes).unwrap();
    let mut q = Query::new(Some("c1"), "/foo/[bar = 22]").unwrap();
    assert!(!q.matched_view(view).unwrap());
    // A corrupt document must not poison subsequent matching.
    assert!(q.matched(&good).unwrap());
}
