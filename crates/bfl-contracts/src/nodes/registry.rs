use indexmap::IndexMap;
use serde_json::json;

use crate::config::DEFAULT_BASE_URL;

use super::schema::{FieldKind, FieldSpec, NodeAction, NodeOutput, NodeSpec, Omit, SEED_SENTINEL};

pub const CATEGORY_GENERATE: &str = "BFL";
pub const CATEGORY_FINETUNE: &str = "BFL/Finetune";
pub const CATEGORY_CONFIG: &str = "BFL/Config";

const ASPECT_RATIOS: &[&str] = &["16:9", "4:3", "1:1", "3:2", "21:9", "9:16", "3:4", "2:3", "9:21"];
const OUTPUT_FORMATS: &[&str] = &["jpeg", "png"];

/// Node catalogue keyed by the host-facing class name, in display order.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    nodes: IndexMap<String, NodeSpec>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl NodeRegistry {
    pub fn new(nodes: Option<IndexMap<String, NodeSpec>>) -> Self {
        Self {
            nodes: nodes.unwrap_or_else(default_nodes),
        }
    }

    pub fn get(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.values()
    }

    pub fn by_category(&self, category: &str) -> Vec<&NodeSpec> {
        self.nodes
            .values()
            .filter(|node| node.category == category)
            .collect()
    }
}

fn prompt() -> FieldSpec {
    FieldSpec::new("prompt", FieldKind::String { multiline: true }, json!(""))
}

fn text(name: &str, default: &str) -> FieldSpec {
    FieldSpec::new(name, FieldKind::String { multiline: false }, json!(default))
}

fn optional_text(name: &str) -> FieldSpec {
    text(name, "").optional().omit(Omit::WhenEmpty)
}

fn int(name: &str, default: i64, min: i64, max: i64) -> FieldSpec {
    FieldSpec::new(
        name,
        FieldKind::Int {
            min: Some(min),
            max: Some(max),
        },
        json!(default),
    )
}

fn float(name: &str, default: f64, min: f64, max: f64) -> FieldSpec {
    FieldSpec::new(name, FieldKind::Float { min, max }, json!(default))
}

fn boolean(name: &str, default: bool) -> FieldSpec {
    FieldSpec::new(name, FieldKind::Bool, json!(default))
}

fn choice(name: &str, options: &[&str], default: &str) -> FieldSpec {
    FieldSpec::new(
        name,
        FieldKind::Choice {
            options: options.iter().map(|item| (*item).to_string()).collect(),
        },
        json!(default),
    )
}

fn seed() -> FieldSpec {
    FieldSpec::new("seed", FieldKind::Int { min: None, max: None }, json!(SEED_SENTINEL))
        .optional()
        .omit(Omit::WhenEquals(SEED_SENTINEL))
}

fn output_format() -> FieldSpec {
    choice("output_format", OUTPUT_FORMATS, "jpeg")
}

fn aspect_ratio() -> FieldSpec {
    choice("aspect_ratio", ASPECT_RATIOS, "16:9")
}

fn safety_tolerance(min: i64) -> FieldSpec {
    int("safety_tolerance", 2, min, 6)
}

fn dims(width: i64, height: i64) -> [FieldSpec; 2] {
    [int("width", width, 256, 1440), int("height", height, 256, 1440)]
}

fn webhooks() -> [FieldSpec; 2] {
    [optional_text("webhook_url"), optional_text("webhook_secret")]
}

fn default_nodes() -> IndexMap<String, NodeSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str,
                      display_name: &str,
                      category: &str,
                      action: NodeAction,
                      fields: Vec<FieldSpec>,
                      accepts_region: bool,
                      output: NodeOutput| {
        map.insert(
            name.to_string(),
            NodeSpec {
                name: name.to_string(),
                display_name: display_name.to_string(),
                category: category.to_string(),
                accepts_config: !matches!(action, NodeAction::CreateConfig),
                action,
                fields,
                accepts_region,
                output,
            },
        );
    };
    let generate = |endpoint: &str| NodeAction::Generate {
        endpoint: endpoint.to_string(),
    };
    let text_output = |names: &[&str]| NodeOutput::Text {
        names: names.iter().map(|item| (*item).to_string()).collect(),
    };

    let [width, height] = dims(1024, 768);
    insert(
        "FluxPro_BFL",
        "Flux Pro (BFL)",
        CATEGORY_GENERATE,
        generate("flux-pro"),
        vec![
            prompt(),
            width,
            height,
            int("steps", 40, 1, 50),
            boolean("prompt_upsampling", false),
            safety_tolerance(1),
            float("guidance", 2.5, 1.5, 5.0),
            int("interval", 2, 1, 4),
            output_format(),
            seed(),
        ],
        false,
        NodeOutput::Image,
    );

    let [width, height] = dims(1440, 1440);
    insert(
        "FluxPro11_BFL",
        "Flux Pro 1.1 (BFL)",
        CATEGORY_GENERATE,
        generate("flux-pro-1.1"),
        vec![
            prompt(),
            width,
            height,
            boolean("prompt_upsampling", false),
            safety_tolerance(1),
            output_format(),
            seed(),
        ],
        false,
        NodeOutput::Image,
    );

    let [width, height] = dims(1024, 768);
    insert(
        "FluxDev_BFL",
        "Flux Dev (BFL)",
        CATEGORY_GENERATE,
        generate("flux-dev"),
        vec![
            prompt(),
            width,
            height,
            int("steps", 28, 1, 50),
            boolean("prompt_upsampling", false),
            safety_tolerance(1),
            float("guidance", 3.0, 1.5, 5.0),
            output_format(),
            seed(),
        ],
        false,
        NodeOutput::Image,
    );

    insert(
        "FluxPro11Ultra_BFL",
        "Flux Pro 1.1 Ultra (BFL)",
        CATEGORY_GENERATE,
        generate("flux-pro-1.1-ultra"),
        vec![
            prompt(),
            aspect_ratio(),
            safety_tolerance(1),
            output_format(),
            boolean("raw", false),
            seed(),
        ],
        false,
        NodeOutput::Image,
    );

    let [width, height] = dims(1024, 768);
    insert(
        "FluxDevRedux_BFL",
        "Flux Dev Redux (BFL)",
        CATEGORY_GENERATE,
        generate("flux-dev"),
        vec![
            prompt(),
            FieldSpec::new("image_prompt", FieldKind::String { multiline: true }, json!("")),
            width,
            height,
            int("steps", 28, 1, 50),
            boolean("prompt_upsampling", false),
            safety_tolerance(1),
            float("guidance", 3.0, 1.5, 5.0),
            output_format(),
            seed(),
        ],
        false,
        NodeOutput::Image,
    );

    let [width, height] = dims(1440, 1440);
    insert(
        "FluxPro11Redux_BFL",
        "Flux Pro 1.1 Redux (BFL)",
        CATEGORY_GENERATE,
        generate("flux-pro-1.1"),
        vec![
            prompt(),
            text("image_prompt", ""),
            width,
            height,
            boolean("prompt_upsampling", false),
            safety_tolerance(1),
            output_format(),
            seed(),
        ],
        false,
        NodeOutput::Image,
    );

    insert(
        "FluxPro11UltraRedux_BFL",
        "Flux Pro 1.1 Ultra Redux (BFL)",
        CATEGORY_GENERATE,
        generate("flux-pro-1.1-ultra"),
        vec![
            prompt(),
            FieldSpec::new("image_prompt", FieldKind::String { multiline: true }, json!("")),
            float("image_prompt_strength", 0.1, 0.0, 1.0),
            aspect_ratio(),
            safety_tolerance(1),
            output_format(),
            boolean("raw", false),
            seed(),
        ],
        false,
        NodeOutput::Image,
    );

    insert(
        "FluxProFill_BFL",
        "Flux Pro Fill (BFL)",
        CATEGORY_GENERATE,
        generate("flux-pro-1.0-fill"),
        vec![
            text("image", ""),
            optional_text("mask"),
            prompt().optional().omit(Omit::WhenEmpty),
            int("steps", 28, 15, 50),
            boolean("prompt_upsampling", false),
            float("guidance", 60.0, 1.5, 100.0),
            safety_tolerance(0),
            output_format(),
            seed(),
        ],
        false,
        NodeOutput::Image,
    );

    for (name, display_name, endpoint) in [
        ("FluxProCanny_BFL", "Flux Pro Canny (BFL)", "flux-pro-1.0-canny"),
        ("FluxProDepth_BFL", "Flux Pro Depth (BFL)", "flux-pro-1.0-depth"),
    ] {
        insert(
            name,
            display_name,
            CATEGORY_GENERATE,
            generate(endpoint),
            vec![
                prompt(),
                text("control_image", ""),
                boolean("prompt_upsampling", false),
                int("steps", 28, 15, 50),
                float("guidance", 60.0, 1.5, 100.0),
                safety_tolerance(0),
                output_format(),
                seed(),
            ],
            false,
            NodeOutput::Image,
        );
    }

    for (name, display_name, endpoint) in [
        ("FluxKontextPro_BFL", "Flux Kontext Pro (BFL)", "flux-kontext-pro"),
        ("FluxKontextMax_BFL", "Flux Kontext Max (BFL)", "flux-kontext-max"),
    ] {
        insert(
            name,
            display_name,
            CATEGORY_GENERATE,
            generate(endpoint),
            vec![
                prompt(),
                text("input_image", ""),
                aspect_ratio(),
                boolean("prompt_upsampling", false),
                safety_tolerance(1),
                output_format(),
                seed(),
            ],
            false,
            NodeOutput::Image,
        );
    }

    let [width, height] = dims(1024, 768);
    let [webhook_url, webhook_secret] = webhooks();
    insert(
        "FluxProFinetune_BFL",
        "Flux Pro Finetune (BFL)",
        CATEGORY_FINETUNE,
        generate("flux-pro-finetuned"),
        vec![
            text("finetune_id", "my-finetune"),
            prompt(),
            float("finetune_strength", 1.2, 0.0, 2.0),
            int("steps", 40, 1, 50),
            float("guidance", 2.5, 1.5, 5.0),
            width,
            height,
            boolean("prompt_upsampling", false),
            safety_tolerance(1),
            output_format(),
            optional_text("image_prompt"),
            seed(),
            webhook_url,
            webhook_secret,
        ],
        true,
        NodeOutput::Image,
    );

    let [webhook_url, webhook_secret] = webhooks();
    insert(
        "FluxProDepthFinetune_BFL",
        "Flux Pro Depth Finetune (BFL)",
        CATEGORY_FINETUNE,
        generate("flux-pro-1.0-depth-finetuned"),
        vec![
            text("finetune_id", "my-finetune"),
            prompt(),
            text("control_image", ""),
            float("finetune_strength", 1.1, 0.1, 2.0),
            boolean("prompt_upsampling", false),
            int("steps", 50, 15, 50),
            output_format(),
            float("guidance", 15.0, 1.5, 100.0),
            safety_tolerance(0),
            seed(),
            webhook_url,
            webhook_secret,
        ],
        false,
        NodeOutput::Image,
    );

    let [webhook_url, webhook_secret] = webhooks();
    insert(
        "FluxProCannyFinetune_BFL",
        "Flux Pro Canny Finetune (BFL)",
        CATEGORY_FINETUNE,
        generate("flux-pro-1.0-canny-finetuned"),
        vec![
            text("finetune_id", "my-finetune"),
            prompt(),
            text("control_image", ""),
            float("finetune_strength", 1.1, 0.1, 2.0),
            int("canny_low_threshold", 250, 0, 255),
            int("canny_high_threshold", 250, 0, 255),
            boolean("prompt_upsampling", false),
            int("steps", 50, 15, 50),
            output_format(),
            float("guidance", 30.0, 1.5, 100.0),
            safety_tolerance(0),
            seed(),
            webhook_url,
            webhook_secret,
        ],
        false,
        NodeOutput::Image,
    );

    let [webhook_url, webhook_secret] = webhooks();
    insert(
        "FluxProFillFinetune_BFL",
        "Flux Pro Fill Finetune (BFL)",
        CATEGORY_FINETUNE,
        generate("flux-pro-1.0-fill-finetuned"),
        vec![
            text("finetune_id", "my-finetune"),
            text("image", ""),
            float("finetune_strength", 1.1, 0.1, 2.0),
            int("steps", 28, 15, 50),
            boolean("prompt_upsampling", false),
            float("guidance", 60.0, 1.5, 100.0),
            safety_tolerance(0),
            output_format(),
            optional_text("mask"),
            prompt().optional().omit(Omit::WhenEmpty),
            seed(),
            webhook_url,
            webhook_secret,
        ],
        false,
        NodeOutput::Image,
    );

    let [webhook_url, webhook_secret] = webhooks();
    insert(
        "FluxPro11UltraFinetune_BFL",
        "Flux Pro 1.1 Ultra Finetune (BFL)",
        CATEGORY_FINETUNE,
        generate("flux-pro-1.1-ultra-finetuned"),
        vec![
            text("finetune_id", "my-finetune"),
            prompt(),
            float("finetune_strength", 1.2, 0.0, 2.0),
            aspect_ratio(),
            safety_tolerance(1),
            output_format(),
            boolean("raw", false),
            seed(),
            webhook_url,
            webhook_secret,
        ],
        true,
        NodeOutput::Image,
    );

    let [webhook_url, webhook_secret] = webhooks();
    insert(
        "FluxFinetune_BFL",
        "Flux Finetune Creator (BFL)",
        CATEGORY_FINETUNE,
        NodeAction::FinetuneCreate,
        vec![
            text("zip_file_path", ""),
            text("finetune_comment", "my-finetune"),
            text("trigger_word", "TOK"),
            choice("mode", &["character", "product", "style", "general"], "general"),
            int("iterations", 300, 100, 2000),
            float("learning_rate", 0.00001, 0.000001, 0.01),
            boolean("captioning", true),
            choice("priority", &["speed", "quality", "high_res_only"], "quality"),
            choice("finetune_type", &["full", "lora"], "full"),
            int("lora_rank", 32, 8, 128),
            webhook_url,
            webhook_secret,
        ],
        true,
        text_output(&["response"]),
    );

    insert(
        "FluxFinetuneStatus_BFL",
        "Flux Finetune Status (BFL)",
        CATEGORY_FINETUNE,
        NodeAction::FinetuneStatus,
        vec![text("finetune_id", "")],
        true,
        text_output(&["status", "progress", "result"]),
    );

    insert(
        "FluxFinetuneList_BFL",
        "Flux Finetune List (BFL)",
        CATEGORY_FINETUNE,
        NodeAction::FinetuneList,
        Vec::new(),
        true,
        text_output(&["finetunes"]),
    );

    insert(
        "FluxFinetuneDetails_BFL",
        "Flux Finetune Details (BFL)",
        CATEGORY_FINETUNE,
        NodeAction::FinetuneDetails,
        vec![text("finetune_id", "")],
        true,
        text_output(&["details"]),
    );

    insert(
        "FluxFinetuneDelete_BFL",
        "Flux Finetune Delete (BFL)",
        CATEGORY_FINETUNE,
        NodeAction::FinetuneDelete,
        vec![text("finetune_id", "")],
        true,
        text_output(&["response"]),
    );

    insert(
        "FluxConfig_BFL",
        "Flux Config (BFL)",
        CATEGORY_CONFIG,
        NodeAction::CreateConfig,
        vec![
            text("x_key", ""),
            text("base_url", DEFAULT_BASE_URL),
            choice("region", &["none", "us", "eu"], "none").optional(),
        ],
        false,
        NodeOutput::Config,
    );

    map
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::nodes::NodeInputs;

    fn inputs(value: Value) -> NodeInputs {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn catalogue_covers_every_variant() {
        let registry = NodeRegistry::default();
        let expected = [
            ("FluxPro_BFL", Some("flux-pro")),
            ("FluxPro11_BFL", Some("flux-pro-1.1")),
            ("FluxDev_BFL", Some("flux-dev")),
            ("FluxPro11Ultra_BFL", Some("flux-pro-1.1-ultra")),
            ("FluxDevRedux_BFL", Some("flux-dev")),
            ("FluxPro11Redux_BFL", Some("flux-pro-1.1")),
            ("FluxPro11UltraRedux_BFL", Some("flux-pro-1.1-ultra")),
            ("FluxProFill_BFL", Some("flux-pro-1.0-fill")),
            ("FluxProCanny_BFL", Some("flux-pro-1.0-canny")),
            ("FluxProDepth_BFL", Some("flux-pro-1.0-depth")),
            ("FluxKontextPro_BFL", Some("flux-kontext-pro")),
            ("FluxKontextMax_BFL", Some("flux-kontext-max")),
            ("FluxProFinetune_BFL", Some("flux-pro-finetuned")),
            ("FluxProDepthFinetune_BFL", Some("flux-pro-1.0-depth-finetuned")),
            ("FluxProCannyFinetune_BFL", Some("flux-pro-1.0-canny-finetuned")),
            ("FluxProFillFinetune_BFL", Some("flux-pro-1.0-fill-finetuned")),
            ("FluxPro11UltraFinetune_BFL", Some("flux-pro-1.1-ultra-finetuned")),
            ("FluxFinetune_BFL", None),
            ("FluxFinetuneStatus_BFL", None),
            ("FluxFinetuneList_BFL", None),
            ("FluxFinetuneDetails_BFL", None),
            ("FluxFinetuneDelete_BFL", None),
            ("FluxConfig_BFL", None),
        ];
        assert_eq!(registry.list().count(), expected.len());
        for (name, endpoint) in expected {
            let node = registry.get(name);
            assert!(node.is_some(), "missing {name}");
            assert_eq!(node.and_then(NodeSpec::endpoint), endpoint, "{name}");
        }
        assert_eq!(registry.by_category(CATEGORY_CONFIG).len(), 1);
        assert_eq!(
            registry.get("FluxPro11_BFL").map(|node| node.display_name.as_str()),
            Some("Flux Pro 1.1 (BFL)")
        );
    }

    #[test]
    fn image_nodes_default_payloads_are_submittable() -> anyhow::Result<()> {
        let registry = NodeRegistry::default();
        for node in registry.list().filter(|node| node.output == NodeOutput::Image) {
            let payload = node.build_payload(&NodeInputs::new())?;
            assert!(!payload.contains_key("seed"), "{}", node.name);
            assert!(!payload.contains_key("config"), "{}", node.name);
            assert!(!payload.contains_key("region"), "{}", node.name);
            assert_eq!(payload.get("output_format"), Some(&json!("jpeg")), "{}", node.name);
        }
        Ok(())
    }

    #[test]
    fn pro_payload_matches_declared_fields() -> anyhow::Result<()> {
        let registry = NodeRegistry::default();
        let node = registry.get("FluxPro_BFL").expect("FluxPro_BFL registered");
        let payload = node.build_payload(&inputs(json!({
            "prompt": "lighthouse at dusk",
            "seed": 42,
            "guidance": 3.5,
        })))?;
        assert_eq!(payload["prompt"], "lighthouse at dusk");
        assert_eq!(payload["seed"], 42);
        assert_eq!(payload["steps"], 40);
        assert_eq!(payload["interval"], 2);
        assert_eq!(payload["guidance"], 3.5);
        assert_eq!(payload["width"], 1024);
        assert_eq!(payload["height"], 768);
        assert_eq!(payload.len(), 10);
        Ok(())
    }

    #[test]
    fn fill_prompt_is_sent_only_when_given() -> anyhow::Result<()> {
        let registry = NodeRegistry::default();
        for name in ["FluxProFill_BFL", "FluxProFillFinetune_BFL"] {
            let node = registry.get(name).expect("fill node registered");
            let bare = node.build_payload(&inputs(json!({"image": "aW1n"})))?;
            assert!(!bare.contains_key("prompt"), "{name}");
            let blank = node.build_payload(&inputs(json!({"image": "aW1n", "prompt": "  "})))?;
            assert!(!blank.contains_key("prompt"), "{name}");
            let given = node.build_payload(&inputs(json!({"image": "aW1n", "prompt": "sky"})))?;
            assert_eq!(given["prompt"], "sky", "{name}");
        }
        Ok(())
    }

    #[test]
    fn regional_nodes_default_to_us() {
        let registry = NodeRegistry::default();
        let finetuned = registry.get("FluxProFinetune_BFL");
        assert_eq!(
            finetuned.and_then(|node| node.region_input(&NodeInputs::new())),
            Some("us".to_string())
        );
        let ultra = registry.get("FluxPro11UltraFinetune_BFL");
        assert_eq!(
            ultra.and_then(|node| node.region_input(&inputs(json!({"region": "eu"})))),
            Some("eu".to_string())
        );
        let dev = registry.get("FluxDev_BFL");
        assert_eq!(dev.and_then(|node| node.region_input(&NodeInputs::new())), None);
    }

    #[test]
    fn config_node_takes_no_override() {
        let registry = NodeRegistry::default();
        let config = registry.get("FluxConfig_BFL");
        assert_eq!(config.map(|node| node.accepts_config), Some(false));
        assert_eq!(
            config
                .and_then(|node| node.field("base_url"))
                .map(|field| field.default.clone()),
            Some(json!(DEFAULT_BASE_URL))
        );
    }
}
