mod registry;
mod schema;

pub use registry::{NodeRegistry, CATEGORY_CONFIG, CATEGORY_FINETUNE, CATEGORY_GENERATE};
pub use schema::{
    check_multiple_of_32, FieldKind, FieldSpec, NodeAction, NodeInputs, NodeOutput, NodeSpec,
    Omit, Payload, DIMENSION_MULTIPLE, REGION_INPUT, SEED_SENTINEL,
};
