//! Program generators. Pure functions of a [`ScriptShape`].
//!
//! Argument layouts, per record:
//!
//! | Operation | Shared keys | Shared args | Record keys | Record args |
//! | --------- | ----------- | ----------- | ----------- | ----------- |
//! | update | reverse hash per query | `[ttl_ms]` | entity key | id, value, query key per query |
//! | delete | reverse hash per query | `[ttl_ms]` | entity key | id |
//! | populate | - | `[ttl_ms]` | entity key | value or void marker |
//!
//! The ttl argument is present only when the shape has one. A query key argument equal to the void marker means "the
//! entity doesn't belong to this query."

use crate::script::ArgRef;
use crate::script::KeyRef;
use crate::script::Layout;
use crate::script::Program;
use crate::script::Script;
use crate::script::ScriptOp;
use crate::script::ScriptShape;
use crate::script::Step;
use crate::types::CacheMode;

pub fn build(shape: &ScriptShape) -> Script {
    Script::new(match shape.op() {
        ScriptOp::Update => update_program(shape),
        ScriptOp::Delete => delete_program(shape),
        ScriptOp::Populate => populate_program(shape),
        ScriptOp::StoreQueryResults => Program::new(
            Layout::Variadic,
            vec![Step::StoreQueryResults {
                reverse: KeyRef::Shared(0),
                kind:    shape.queries()[0],
            }],
        ),
        ScriptOp::ForgetQueryResults => Program::new(
            Layout::Variadic,
            vec![Step::ForgetQueryResults {
                reverse: KeyRef::Shared(0),
                kind:    shape.queries()[0],
            }],
        ),
        ScriptOp::ReadQuerySets => Program::new(Layout::Variadic, vec![Step::ReadQuerySets]),
    })
}

#[inline]
fn ttl_slot(shape: &ScriptShape) -> Option<ArgRef> {
    shape.has_ttl().then_some(ArgRef::Shared(0))
}

fn entity_write(mode: CacheMode, ttl: Option<ArgRef>) -> Step {
    match mode {
        CacheMode::NoCache => Step::RemoveEntity {
            key: KeyRef::Local(0),
            void: false,
            ttl: None,
        },
        CacheMode::CacheIfNotExist => Step::WriteEntity {
            key: KeyRef::Local(0),
            value: ArgRef::Local(1),
            only_if_absent: true,
            ttl,
        },
        CacheMode::CacheAndOverwrite => Step::WriteEntity {
            key: KeyRef::Local(0),
            value: ArgRef::Local(1),
            only_if_absent: false,
            ttl,
        },
    }
}

fn update_program(shape: &ScriptShape) -> Program {
    let queries = shape.queries();
    let mut steps = Vec::with_capacity(queries.len() * 2 + 1);

    for (i, kind) in queries.iter().enumerate() {
        steps.push(Step::EvictFromQuery {
            reverse: KeyRef::Shared(i),
            id:      ArgRef::Local(0),
            kind:    *kind,
        });
        steps.push(Step::FileIntoQuery {
            reverse:   KeyRef::Shared(i),
            id:        ArgRef::Local(0),
            query_key: ArgRef::Local(2 + i),
            kind:      *kind,
        });
    }
    steps.push(entity_write(shape.cache_mode(), ttl_slot(shape)));

    Program::new(
        Layout::Fixed {
            shared_keys: queries.len(),
            shared_args: shape.has_ttl() as usize,
            local_keys:  1,
            local_args:  2 + queries.len(),
            repeat:      shape.is_batch(),
        },
        steps,
    )
}

fn delete_program(shape: &ScriptShape) -> Program {
    let queries = shape.queries();
    let mut steps = queries
        .iter()
        .enumerate()
        .map(|(i, kind)| Step::EvictFromQuery {
            reverse: KeyRef::Shared(i),
            id:      ArgRef::Local(0),
            kind:    *kind,
        })
        .collect::<Vec<_>>();
    steps.push(Step::RemoveEntity {
        key:  KeyRef::Local(0),
        void: shape.is_negative(),
        ttl:  ttl_slot(shape),
    });

    Program::new(
        Layout::Fixed {
            shared_keys: queries.len(),
            shared_args: shape.has_ttl() as usize,
            local_keys:  1,
            local_args:  1,
            repeat:      shape.is_batch(),
        },
        steps,
    )
}

fn populate_program(shape: &ScriptShape) -> Program {
    let only_if_absent = match shape.cache_mode() {
        CacheMode::NoCache => {
            return Program::new(
                Layout::Fixed {
                    shared_keys: 0,
                    shared_args: shape.has_ttl() as usize,
                    local_keys:  1,
                    local_args:  1,
                    repeat:      true,
                },
                vec![],
            )
        }
        CacheMode::CacheIfNotExist => true,
        CacheMode::CacheAndOverwrite => false,
    };

    Program::new(
        Layout::Fixed {
            shared_keys: 0,
            shared_args: shape.has_ttl() as usize,
            local_keys:  1,
            local_args:  1,
            repeat:      true,
        },
        vec![Step::WriteEntity {
            key: KeyRef::Local(0),
            value: ArgRef::Local(0),
            only_if_absent,
            ttl: ttl_slot(shape),
        }],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryKind;

    #[test]
    fn update_layout_tracks_queries_and_ttl() {
        let shape = ScriptShape::update(
            vec![QueryKind::Single, QueryKind::Multiple],
            CacheMode::CacheIfNotExist,
            true,
            true,
        );
        let script = build(&shape);
        let program = script.program();

        assert_eq!(
            program.layout(),
            Layout::Fixed {
                shared_keys: 2,
                shared_args: 1,
                local_keys:  1,
                local_args:  4,
                repeat:      true,
            }
        );
        assert_eq!(program.steps().len(), 5);
        assert_eq!(
            program.steps()[3],
            Step::FileIntoQuery {
                reverse:   KeyRef::Shared(1),
                id:        ArgRef::Local(0),
                query_key: ArgRef::Local(3),
                kind:      QueryKind::Multiple,
            }
        );
        assert_eq!(
            program.steps()[4],
            Step::WriteEntity {
                key:            KeyRef::Local(0),
                value:          ArgRef::Local(1),
                only_if_absent: true,
                ttl:            Some(ArgRef::Shared(0)),
            }
        );
    }

    #[test]
    fn update_without_caching_drops_entity_entry() {
        let script = build(&ScriptShape::update(vec![], CacheMode::NoCache, false, false));
        assert_eq!(
            script.program().steps(),
            &[Step::RemoveEntity {
                key:  KeyRef::Local(0),
                void: false,
                ttl:  None,
            }]
        );
    }

    #[test]
    fn delete_voids_only_with_negative_cache() {
        let positive = build(&ScriptShape::delete(vec![QueryKind::Single], false, false, false));
        let negative = build(&ScriptShape::delete(vec![QueryKind::Single], true, false, false));

        assert!(matches!(
            positive.program().steps().last(),
            Some(Step::RemoveEntity { void: false, .. })
        ));
        assert!(matches!(
            negative.program().steps().last(),
            Some(Step::RemoveEntity { void: true, .. })
        ));
        assert_ne!(positive.hash(), negative.hash());
    }

    #[test]
    fn single_and_batch_shapes_differ() {
        let single = build(&ScriptShape::delete(vec![], false, false, false));
        let batch = build(&ScriptShape::delete(vec![], false, false, true));
        assert_ne!(single.hash(), batch.hash());
    }

    #[test]
    fn generation_is_deterministic() {
        let shape = ScriptShape::update(vec![QueryKind::Multiple], CacheMode::CacheAndOverwrite, false, false);
        assert_eq!(build(&shape).source(), build(&shape.clone()).source());
    }
}
