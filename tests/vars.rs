use quoll::{Var, VarsContext, VarsDump, VarsError, VarsMapper};

fn dump_json(context: &VarsContext) -> String {
    serde_json::to_string(&context.dump()).unwrap()
}

#[test]
fn sparse_by_int() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    x.at(1).unwrap().set(2.0).unwrap();
    x.at(100).unwrap().set(101.0).unwrap();
    x.at(42).unwrap().set(0.0).unwrap();

    assert_eq!(x.at(1).unwrap().var_index().unwrap(), 0);
    assert_eq!(x.at(100).unwrap().var_index().unwrap(), 1);
    assert_eq!(x.at(42).unwrap().var_index().unwrap(), 2);
    assert_eq!(x.at(1).unwrap().full_name().unwrap(), "x[1]");
    assert_eq!(x.at(100).unwrap().full_name().unwrap(), "x[100]");
    assert_eq!(x.at(42).unwrap().full_name().unwrap(), "x[42]");

    // Keys are ordered in the dump; `q` follows the introduction order.
    assert_eq!(
        dump_json(&context),
        r#"{"I":{"z":[[1,{"X":{"q":0,"x":2.0}}],[42,{"X":{"q":2,"x":0.0}}],[100,{"X":{"q":1,"x":101.0}}]]}}"#
    );

    assert_eq!(
        x.dense_double_vector(100),
        Err(VarsError::NodeTypeMismatch)
    );
    assert_eq!(x.key("foo").unwrap_err(), VarsError::NodeTypeMismatch);
    assert_eq!(x.at(1).unwrap().at(2).unwrap_err(), VarsError::NodeTypeMismatch);
    assert_eq!(
        x.at(1).unwrap().key("blah").unwrap_err(),
        VarsError::NodeTypeMismatch
    );
    assert_eq!(
        x.at(1).unwrap().dense_double_vector(100),
        Err(VarsError::NodeTypeMismatch)
    );

    // `i` is stamped by freeze in lexicographic (ascending key) order.
    assert_eq!(context.unfreeze(), Err(VarsError::NotFrozen));
    context.freeze().unwrap();
    assert!(matches!(context.freeze(), Err(VarsError::AlreadyFrozen)));
    assert_eq!(
        dump_json(&context),
        r#"{"I":{"z":[[1,{"X":{"q":0,"i":0,"x":2.0}}],[42,{"X":{"q":2,"i":1,"x":0.0}}],[100,{"X":{"q":1,"i":2,"x":101.0}}]]}}"#
    );
}

#[test]
fn sparse_by_string() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    x.key("foo").unwrap().set(1.0).unwrap();
    x.key("bar").unwrap().set(2.0).unwrap();
    x.key("baz").unwrap().set(3.0).unwrap();

    assert_eq!(
        dump_json(&context),
        r#"{"S":{"z":{"bar":{"X":{"q":1,"x":2.0}},"baz":{"X":{"q":2,"x":3.0}},"foo":{"X":{"q":0,"x":1.0}}}}}"#
    );

    assert_eq!(x.dense_double_vector(100), Err(VarsError::NodeTypeMismatch));
    assert_eq!(x.at(42).unwrap_err(), VarsError::NodeTypeMismatch);
    assert_eq!(
        x.key("foo").unwrap().at(2).unwrap_err(),
        VarsError::NodeTypeMismatch
    );
    assert_eq!(
        x.key("foo").unwrap().key("blah").unwrap_err(),
        VarsError::NodeTypeMismatch
    );

    context.freeze().unwrap();
    assert_eq!(
        dump_json(&context),
        r#"{"S":{"z":{"bar":{"X":{"q":1,"i":0,"x":2.0}},"baz":{"X":{"q":2,"i":1,"x":3.0}},"foo":{"X":{"q":0,"i":2,"x":1.0}}}}}"#
    );
}

#[test]
fn empty_string_allowed_as_var_name() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    x.key("ok").unwrap().set(1.0).unwrap();
    x.key("").unwrap().set(2.0).unwrap();
    x.key("nested").unwrap().key("also ok").unwrap().set(3.0).unwrap();
    x.key("nested").unwrap().key("").unwrap().set(4.0).unwrap();

    assert_eq!(x.key("ok").unwrap().full_name().unwrap(), "x[\"ok\"]");
    assert_eq!(x.key("").unwrap().full_name().unwrap(), "x[\"\"]");
    assert_eq!(
        x.key("nested").unwrap().key("").unwrap().full_name().unwrap(),
        "x[\"nested\"][\"\"]"
    );
}

#[test]
fn dense_vector() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    x.dense_double_vector(5).unwrap();
    x.at(2).unwrap().set(2.0).unwrap();
    x.at(4).unwrap().set(4.0).unwrap();

    assert_eq!(
        dump_json(&context),
        r#"{"V":{"z":[{"U":{}},{"U":{}},{"X":{"q":0,"x":2.0}},{"U":{}},{"X":{"q":1,"x":4.0}}]}}"#
    );

    assert!(matches!(x.at(42), Err(VarsError::Management(_))));
    assert_eq!(x.key("foo").unwrap_err(), VarsError::NodeTypeMismatch);

    // Same dimension: a valid no-op. A different one: an error.
    x.dense_double_vector(5).unwrap();
    assert_eq!(x.dense_double_vector(100), Err(VarsError::NodeTypeMismatch));

    // Same value: a valid no-op. A different one: an error.
    x.at(2).unwrap().set(2.0).unwrap();
    assert_eq!(
        x.at(2).unwrap().set(3.0),
        Err(VarsError::ReassignmentAttempt)
    );

    context.freeze().unwrap();
    assert_eq!(
        dump_json(&context),
        r#"{"V":{"z":[{"U":{}},{"U":{}},{"X":{"q":0,"i":0,"x":2.0}},{"U":{}},{"X":{"q":1,"i":1,"x":4.0}}]}}"#
    );
}

#[test]
fn internal_var_indexes() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    x.key("foo").unwrap().at(1).unwrap().set(2.0).unwrap();
    assert_eq!(x.key("foo").unwrap().at(1).unwrap().var_index().unwrap(), 0);
    // Valid paths that are not leaves.
    assert_eq!(
        x.key("foo").unwrap().var_index().unwrap_err(),
        VarsError::NotLeaf
    );
    assert_eq!(
        x.key("foo").unwrap().at(0).unwrap().var_index().unwrap_err(),
        VarsError::NotLeaf
    );
    // Invalid paths fail earlier, with the type mismatch error.
    assert_eq!(
        x.key("foo").unwrap().key("bar").unwrap_err(),
        VarsError::NodeTypeMismatch
    );
    assert_eq!(x.at(0).unwrap_err(), VarsError::NodeTypeMismatch);
}

#[test]
fn frozen_tree_rejects_new_leaves() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    x.key("dense").unwrap().dense_double_vector(2).unwrap();
    x.key("dense").unwrap().at(0).unwrap().set(0.0).unwrap();
    x.key("dense").unwrap().at(1).unwrap().set(0.0).unwrap();
    x.key("sparse").unwrap().at(42).unwrap().set(42.0).unwrap();
    x.key("strings").unwrap().key("foo").unwrap().set(1.0).unwrap();
    context.freeze().unwrap();

    // Existing nodes stay accessible.
    x.key("dense").unwrap().at(0).unwrap();
    x.key("dense").unwrap().at(1).unwrap();
    x.key("sparse").unwrap().at(42).unwrap();
    x.key("strings").unwrap().key("foo").unwrap();

    assert_eq!(
        x.key("dense").unwrap().at(2).unwrap_err(),
        VarsError::Frozen
    );
    assert_eq!(
        x.key("sparse").unwrap().at(100).unwrap_err(),
        VarsError::Frozen
    );
    assert_eq!(
        x.key("strings").unwrap().key("bar").unwrap_err(),
        VarsError::Frozen
    );
    assert_eq!(x.key("foo").unwrap_err(), VarsError::Frozen);
}

#[test]
fn unfreeze_and_reindex() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    x.dense_double_vector(5).unwrap();
    x.at(2).unwrap().set(2.0).unwrap();
    x.at(4).unwrap().set(4.0).unwrap();
    assert_eq!(context.num_vars(), 2);

    context.freeze().unwrap();
    assert_eq!(x.at(2).unwrap().full_name().unwrap(), "x[2]{0}");
    assert_eq!(x.at(4).unwrap().full_name().unwrap(), "x[4]{1}");
    assert_eq!(x.at(3).unwrap().set(3.0), Err(VarsError::Frozen));
    assert_eq!(context.num_vars(), 2);

    context.unfreeze().unwrap();
    // A new leaf can be added now, but it has no frozen index yet.
    x.at(3).unwrap().set(3.0).unwrap();
    assert_eq!(context.num_vars(), 3);
    assert_eq!(
        dump_json(&context),
        r#"{"V":{"z":[{"U":{}},{"U":{}},{"X":{"q":0,"x":2.0}},{"X":{"q":2,"x":3.0}},{"X":{"q":1,"x":4.0}}]}}"#
    );
    assert_eq!(x.at(3).unwrap().full_name().unwrap(), "x[3]");

    // After the re-freeze, the new leaf is indexed, shifting `x[4]`.
    context.freeze().unwrap();
    assert_eq!(x.at(2).unwrap().full_name().unwrap(), "x[2]{0}");
    assert_eq!(x.at(3).unwrap().full_name().unwrap(), "x[3]{1}");
    assert_eq!(x.at(4).unwrap().full_name().unwrap(), "x[4]{2}");
    assert_eq!(
        dump_json(&context),
        r#"{"V":{"z":[{"U":{}},{"U":{}},{"X":{"q":0,"i":0,"x":2.0}},{"X":{"q":2,"i":1,"x":3.0}},{"X":{"q":1,"i":2,"x":4.0}}]}}"#
    );
}

#[test]
fn multi_dimensional_int_int() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    x.at(1).unwrap().at(2).unwrap().set(3.0).unwrap();
    x.at(4).unwrap().at(5).unwrap().set(6.0).unwrap();
    assert_eq!(
        dump_json(&context),
        r#"{"I":{"z":[[1,{"I":{"z":[[2,{"X":{"q":0,"x":3.0}}]]}}],[4,{"I":{"z":[[5,{"X":{"q":1,"x":6.0}}]]}}]]}}"#
    );
    context.freeze().unwrap();
    assert_eq!(
        dump_json(&context),
        r#"{"I":{"z":[[1,{"I":{"z":[[2,{"X":{"q":0,"i":0,"x":3.0}}]]}}],[4,{"I":{"z":[[5,{"X":{"q":1,"i":1,"x":6.0}}]]}}]]}}"#
    );
}

#[test]
fn multi_dimensional_string_int() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    x.key("foo").unwrap().at(1).unwrap().set(2.0).unwrap();
    x.key("bar").unwrap().at(3).unwrap().set(4.0).unwrap();
    assert_eq!(
        dump_json(&context),
        r#"{"S":{"z":{"bar":{"I":{"z":[[3,{"X":{"q":1,"x":4.0}}]]}},"foo":{"I":{"z":[[1,{"X":{"q":0,"x":2.0}}]]}}}}}"#
    );
    context.freeze().unwrap();
    // "bar" sorts before "foo": its leaf takes index 0.
    assert_eq!(
        dump_json(&context),
        r#"{"S":{"z":{"bar":{"I":{"z":[[3,{"X":{"q":1,"i":0,"x":4.0}}]]}},"foo":{"I":{"z":[[1,{"X":{"q":0,"i":1,"x":2.0}}]]}}}}}"#
    );
}

#[test]
fn constants() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    x.key("one").unwrap().set(1.0).unwrap();
    x.key("two").unwrap().set(2.0).unwrap();
    x.key("three").unwrap().set(3.0).unwrap();

    x.key("two").unwrap().set_constant().unwrap();
    x.key("three").unwrap().set_constant_value(3.0).unwrap();
    x.key("four").unwrap().set_constant_value(4.0).unwrap();
    assert_eq!(
        x.key("one").unwrap().set_constant_value(42.0),
        Err(VarsError::ReassignmentAttempt)
    );

    assert_eq!(
        dump_json(&context),
        r#"{"S":{"z":{"four":{"X":{"q":3,"x":4.0,"c":true}},"one":{"X":{"q":0,"x":1.0}},"three":{"X":{"q":2,"x":3.0,"c":true}},"two":{"X":{"q":1,"x":2.0,"c":true}}}}}"#
    );
}

#[test]
fn dense_representation_and_mapper() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    // Values added in an arbitrary order; the freeze sorts them.
    x.key("x").unwrap().key("x1").unwrap().set(101.0).unwrap();
    x.key("x").unwrap().key("x3").unwrap().set(103.0).unwrap();
    x.key("x").unwrap().key("x2").unwrap().set(102.0).unwrap();
    x.key("y").unwrap().at(0).unwrap().at(0).unwrap().set(200.0).unwrap();
    x.key("y").unwrap().at(1).unwrap().at(1).unwrap().set(211.0).unwrap();
    x.key("y").unwrap().at(0).unwrap().at(1).unwrap().set(201.0).unwrap();
    x.key("y").unwrap().at(1).unwrap().at(0).unwrap().set(210.0).unwrap();
    x.key("x").unwrap().key("x2").unwrap().set_constant().unwrap();
    x.key("y").unwrap().at(1).unwrap().at(0).unwrap().set_constant().unwrap();

    let config = context.freeze().unwrap();
    assert_eq!(config.len(), 7);
    assert_eq!(
        config.name,
        vec![
            "x[\"x\"][\"x1\"]{0}",
            "x[\"x\"][\"x2\"]{1}",
            "x[\"x\"][\"x3\"]{2}",
            "x[\"y\"][0][0]{3}",
            "x[\"y\"][0][1]{4}",
            "x[\"y\"][1][0]{5}",
            "x[\"y\"][1][1]{6}",
        ]
    );
    assert_eq!(
        config.x0,
        vec![101.0, 102.0, 103.0, 200.0, 201.0, 210.0, 211.0]
    );
    assert_eq!(
        config.is_constant,
        vec![false, true, false, false, false, true, false]
    );

    let mut a = VarsMapper::new(&config);
    let mut b = VarsMapper::new(&config); // Mappers are independent.
    assert_eq!(a.x, config.x0);
    assert_eq!(b.x, config.x0);

    a.key("x").unwrap().key("x1").unwrap().set(70101.0).unwrap();
    a.key("x")
        .unwrap()
        .key("x2")
        .unwrap()
        .set_constant_value(70102.0)
        .unwrap();
    a.key("y").unwrap().at(1).unwrap().at(1).unwrap().set(70211.0).unwrap();

    b.key("x").unwrap().key("x1").unwrap().set(80101.0).unwrap();
    *b.key("y")
        .unwrap()
        .at(1)
        .unwrap()
        .at(1)
        .unwrap()
        .ref_mut()
        .unwrap() = 80211.0;
    *b.key("x")
        .unwrap()
        .key("x2")
        .unwrap()
        .ref_even_for_a_constant()
        .unwrap() = 80102.0;

    assert_eq!(a.x[0], 70101.0);
    assert_eq!(a.x[1], 70102.0);
    assert_eq!(a.x[6], 70211.0);
    assert_eq!(b.x[0], 80101.0);
    assert_eq!(b.x[1], 80102.0);
    assert_eq!(b.x[6], 80211.0);

    assert_eq!(a.at(42).unwrap_err(), VarsError::MapperWrongVar);
    assert_eq!(a.key("z").unwrap_err(), VarsError::MapperWrongVar);
    assert_eq!(
        a.key("x").unwrap().at(42).unwrap_err(),
        VarsError::MapperWrongVar
    );
    assert_eq!(
        a.key("x").unwrap().key("x4").unwrap_err(),
        VarsError::MapperWrongVar
    );
    assert_eq!(
        a.key("x").unwrap().key("x1").unwrap().key("foo").unwrap_err(),
        VarsError::MapperWrongVar
    );
    assert_eq!(
        a.key("y").unwrap().set(0.0),
        Err(VarsError::MapperNodeNotVar)
    );
    assert_eq!(
        a.key("x").unwrap().key("x2").unwrap().ref_mut().unwrap_err(),
        VarsError::MapperVarIsConstant
    );
    assert_eq!(
        a.key("x").unwrap().key("x2").unwrap().set(0.0),
        Err(VarsError::MapperVarIsConstant)
    );
}

#[test]
fn dense_vector_dimension_bounds() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    assert!(matches!(
        x.dense_double_vector(0),
        Err(VarsError::Management(_))
    ));
    assert!(matches!(
        x.dense_double_vector(1_000_001),
        Err(VarsError::Management(_))
    ));
    x.dense_double_vector(1_000_000).unwrap();
}

#[test]
fn operations_need_an_active_context() {
    let x = Var::root();
    assert!(matches!(x.key("should fail"), Err(VarsError::Management(_))));
    assert!(matches!(x.at(42), Err(VarsError::Management(_))));
    assert!(matches!(
        x.dense_double_vector(1),
        Err(VarsError::Management(_))
    ));
}

#[test]
fn no_nested_contexts_allowed() {
    let _context = VarsContext::new().unwrap();
    assert!(matches!(VarsContext::new(), Err(VarsError::Management(_))));
}

#[test]
fn freeze_unfreeze_freeze_is_stable() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    x.key("b").unwrap().set(2.0).unwrap();
    x.key("a").unwrap().set(1.0).unwrap();
    x.key("a").unwrap().set_constant().unwrap();

    let first = context.freeze().unwrap();
    context.unfreeze().unwrap();
    let second = context.freeze().unwrap();

    assert_eq!(first.name, second.name);
    assert_eq!(first.x0, second.x0);
    assert_eq!(first.is_constant, second.is_constant);
}

/// Re-create the dumped tree in the active context. Only meaningful when
/// the source tree was built in lexicographic order, so the re-created `q`
/// indices match the original ones.
fn rebuild_from_dump(at: Var, dump: &VarsDump) {
    match dump {
        VarsDump::I { z } => {
            for (key, child) in z {
                rebuild_from_dump(at.at(*key as usize).unwrap(), child);
            }
        }
        VarsDump::S { z } => {
            for (key, child) in z {
                rebuild_from_dump(at.key(key).unwrap(), child);
            }
        }
        VarsDump::V { z } => {
            at.dense_double_vector(z.len()).unwrap();
            for (index, child) in z.iter().enumerate() {
                rebuild_from_dump(at.at(index).unwrap(), child);
            }
        }
        VarsDump::X { x, c, .. } => {
            if c.unwrap_or(false) {
                at.set_constant_value(*x).unwrap();
            } else {
                at.set(*x).unwrap();
            }
        }
        VarsDump::U {} => {}
    }
}

#[test]
fn dump_reloads_into_an_identical_tree() {
    // Leaves are introduced in lexicographic order on purpose, so the
    // rebuilt tree reproduces the `q` stamps.
    let original = {
        let context = VarsContext::new().unwrap();
        let x = context.x();
        x.key("i").unwrap().at(7).unwrap().set_constant_value(3.5).unwrap();
        x.key("s").unwrap().key("k").unwrap().set(1.5).unwrap();
        x.key("v").unwrap().dense_double_vector(3).unwrap();
        x.key("v").unwrap().at(1).unwrap().set(2.5).unwrap();
        context.freeze().unwrap();
        context.dump()
    };

    let context = VarsContext::new().unwrap();
    rebuild_from_dump(context.x(), &original);
    context.freeze().unwrap();
    assert_eq!(
        serde_json::to_string(&context.dump()).unwrap(),
        serde_json::to_string(&original).unwrap()
    );
}

#[test]
fn dump_round_trips_through_json() {
    let context = VarsContext::new().unwrap();
    let x = context.x();
    x.key("s").unwrap().key("k").unwrap().set(1.5).unwrap();
    x.key("v").unwrap().dense_double_vector(3).unwrap();
    x.key("v").unwrap().at(1).unwrap().set(2.5).unwrap();
    x.key("i").unwrap().at(7).unwrap().set_constant_value(3.5).unwrap();
    context.freeze().unwrap();

    let dumped = serde_json::to_string(&context.dump()).unwrap();
    let reloaded: VarsDump = serde_json::from_str(&dumped).unwrap();
    assert_eq!(serde_json::to_string(&reloaded).unwrap(), dumped);
    assert_eq!(reloaded, context.dump());
}
