use serde_json::{json, Map, Value};

use crate::template::{Resource, Stack, TagStyle};

pub const NAME: &str = "Name";
pub const SERVICE: &str = "Service";
pub const ENVIRONMENT: &str = "Environment";

/// Visitor run over every resource of a stack after it has been built.
pub trait Aspect {
    fn visit(&self, logical_id: &str, resource: &mut Resource);
}

/// Applies the `Name`, `Service` and `Environment` tags to every resource that
/// accepts tags.
#[derive(Debug, Clone)]
pub struct TagAspect {
    service: String,
    environment: String,
}

impl TagAspect {
    pub fn new(service: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            environment: environment.into(),
        }
    }

    pub fn apply(&self, stack: &mut Stack) {
        for (logical_id, resource) in stack.resources_mut() {
            self.visit(logical_id, resource);
        }
    }

    fn display_name(&self, resource: &Resource) -> String {
        if resource.qualified_name {
            return format!("{}-{}", self.service, self.environment);
        }

        match &resource.label {
            Some(label) => format!("{} {} {}", self.service, self.environment, label),
            None => format!("{} {}", self.service, self.environment),
        }
    }
}

/// Replaces the tag list a resource keeps for `style`.
fn store_tags(properties: &mut Map<String, Value>, style: TagStyle, tags: Vec<Value>) {
    let resource_type = match style {
        TagStyle::TagSpecifications(resource_type) => resource_type,
        _ => {
            properties.insert("Tags".to_string(), Value::Array(tags));
            return;
        }
    };

    let specification = json!({ "ResourceType": resource_type, "Tags": tags });
    let specifications = properties
        .entry("TagSpecifications")
        .or_insert_with(|| Value::Array(Vec::new()));
    match specifications.as_array_mut() {
        Some(specifications) => {
            specifications.retain(|spec| spec.get("ResourceType").and_then(Value::as_str) != Some(resource_type));
            specifications.push(specification);
        }
        None => *specifications = Value::Array(vec![specification]),
    }
}

impl Aspect for TagAspect {
    fn visit(&self, logical_id: &str, resource: &mut Resource) {
        let style = resource.kind.tag_style();
        if style == TagStyle::Untaggable {
            return;
        }

        let labels = [
            (NAME, self.display_name(resource)),
            (SERVICE, self.service.clone()),
            (ENVIRONMENT, self.environment.clone()),
        ];

        let mut tags: Vec<Value> = resource.tags().cloned().unwrap_or_default();
        tags.retain(|tag| {
            let key = tag.get("Key").and_then(Value::as_str);
            !labels.iter().any(|(label, _)| Some(*label) == key)
        });
        for (key, value) in labels {
            let tag = match style {
                TagStyle::PropagateAtLaunch => {
                    json!({ "Key": key, "Value": value, "PropagateAtLaunch": true })
                }
                _ => json!({ "Key": key, "Value": value }),
            };
            tags.push(tag);
        }
        tags.sort_by(|a, b| a["Key"].as_str().cmp(&b["Key"].as_str()));

        tracing::trace!(logical_id, kind = resource.kind.type_name(), "tagging");
        if let Some(properties) = resource.properties.as_object_mut() {
            store_tags(properties, style, tags);
        }
    }
}

/// Required tag keys a taggable resource is missing.
pub fn missing_tags(resource: &Resource) -> Vec<&'static str> {
    if resource.kind.tag_style() == TagStyle::Untaggable {
        return Vec::new();
    }

    [NAME, SERVICE, ENVIRONMENT]
        .into_iter()
        .filter(|key| resource.tag(key).is_none())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::ResourceKind;

    fn stack() -> Stack {
        let mut stack = Stack::new("svc-prod-network", "network");
        let resources = [
            ("Vpc", Resource::new(ResourceKind::Vpc, json!({}))),
            (
                "SubnetIngress1",
                Resource::new(ResourceKind::Subnet, json!({})).labelled("ingress"),
            ),
            (
                "SubnetIngress1DefaultRoute",
                Resource::new(ResourceKind::Route, json!({})),
            ),
            (
                "AutoScalingGroup",
                Resource::new(ResourceKind::AutoScalingGroup, json!({})).qualified_name(),
            ),
            (
                "LaunchTemplate",
                Resource::new(
                    ResourceKind::LaunchTemplate,
                    json!({
                        "LaunchTemplateData": {},
                        "TagSpecifications": [
                            { "ResourceType": "instance", "Tags": [{ "Key": "Role", "Value": "ecs" }] },
                        ],
                    }),
                ),
            ),
        ];
        for (logical_id, resource) in resources {
            stack.add(logical_id, resource).unwrap();
        }
        stack
    }

    #[test]
    fn tags_every_taggable_resource() {
        let mut stack = stack();
        TagAspect::new("svc", "prod").apply(&mut stack);

        for (id, resource) in stack.resources() {
            assert!(missing_tags(resource).is_empty(), "{id} is missing tags");
        }
        let vpc = stack.resource("Vpc").unwrap();
        assert_eq!(vpc.tag(NAME), Some("svc prod"));
        assert_eq!(vpc.tag(SERVICE), Some("svc"));
        assert_eq!(vpc.tag(ENVIRONMENT), Some("prod"));
        assert_eq!(
            stack.resource("SubnetIngress1").unwrap().tag(NAME),
            Some("svc prod ingress")
        );
    }

    #[test]
    fn leaves_untaggable_resources_alone() {
        let mut stack = stack();
        TagAspect::new("svc", "prod").apply(&mut stack);

        let route = stack.resource("SubnetIngress1DefaultRoute").unwrap();
        assert!(route.property("Tags").is_none());
    }

    #[test]
    fn auto_scaling_tags_propagate_at_launch() {
        let mut stack = stack();
        TagAspect::new("svc", "prod").apply(&mut stack);

        let tags = stack
            .resource("AutoScalingGroup")
            .unwrap()
            .property("Tags")
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(tags.len(), 3);
        assert!(tags.iter().all(|tag| tag["PropagateAtLaunch"] == true));
    }

    #[test]
    fn qualified_resources_use_hyphenated_names() {
        let mut stack = stack();
        TagAspect::new("svc", "prod").apply(&mut stack);

        assert_eq!(
            stack.resource("AutoScalingGroup").unwrap().tag(NAME),
            Some("svc-prod")
        );
        assert_eq!(stack.resource("Vpc").unwrap().tag(NAME), Some("svc prod"));
    }

    #[test]
    fn launch_templates_are_tagged_through_tag_specifications() {
        let mut stack = stack();
        TagAspect::new("svc", "prod").apply(&mut stack);
        TagAspect::new("svc", "prod").apply(&mut stack);

        let template = stack.resource("LaunchTemplate").unwrap();
        assert!(missing_tags(template).is_empty());
        assert!(template.property("Tags").is_none());
        assert_eq!(template.tag(SERVICE), Some("svc"));

        let specifications = template.property("TagSpecifications").unwrap().as_array().unwrap();
        assert_eq!(specifications.len(), 2);
        assert_eq!(specifications[0]["ResourceType"], "instance");
        assert_eq!(specifications[0]["Tags"], json!([{ "Key": "Role", "Value": "ecs" }]));
        assert_eq!(specifications[1]["ResourceType"], "launch-template");
        assert_eq!(specifications[1]["Tags"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn untagged_launch_template_is_reported() {
        let resource = Resource::new(ResourceKind::LaunchTemplate, json!({ "LaunchTemplateData": {} }));

        assert_eq!(missing_tags(&resource), vec![NAME, SERVICE, ENVIRONMENT]);
    }

    #[test]
    fn reapplying_replaces_instead_of_duplicating() {
        let mut stack = stack();
        TagAspect::new("svc", "prod").apply(&mut stack);
        TagAspect::new("svc", "staging").apply(&mut stack);

        let vpc = stack.resource("Vpc").unwrap();
        assert_eq!(vpc.property("Tags").unwrap().as_array().unwrap().len(), 3);
        assert_eq!(vpc.tag(ENVIRONMENT), Some("staging"));
    }
}
