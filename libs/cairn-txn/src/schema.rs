//! Element-descriptor schema table driving the Upsert Engine's walk.
//!
//! A handful of resource types (`Patient`, `Observation`) are hand-authored
//! here, covering every element kind the upsert algorithm has to handle:
//! card-one/-many primitives, card-one/-many composites, choice-typed
//! elements, references, contained resources, and codes. Anything else
//! falls back to a schema inferred from the shape of the incoming JSON
//! itself, so the walker never refuses a resource type — it just loses the
//! stable-identity/choice/reference precision that a hand-authored schema
//! gives it.

use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementKind {
    Primitive,
    Composite,
    Reference,
    ContainedResource,
}

#[derive(Clone, Debug)]
pub struct ChoiceVariant {
    pub field_name: String,
    pub kind: ElementKind,
    pub children: Vec<ElementDescriptor>,
}

#[derive(Clone, Debug)]
pub struct ElementDescriptor {
    pub name: String,
    pub cardinality: Cardinality,
    pub kind: ElementKind,
    pub children: Vec<ElementDescriptor>,
    pub choice_variants: Vec<ChoiceVariant>,
    /// True for a `Coding`-shaped composite: its `system`/`version`/`code`
    /// children are interned as a unit when present.
    pub codeable: bool,
}

impl ElementDescriptor {
    fn leaf(name: &str, cardinality: Cardinality, kind: ElementKind) -> Self {
        Self {
            name: name.to_string(),
            cardinality,
            kind,
            children: Vec::new(),
            choice_variants: Vec::new(),
            codeable: false,
        }
    }

    pub fn primitive(name: &str) -> Self {
        Self::leaf(name, Cardinality::One, ElementKind::Primitive)
    }

    pub fn primitive_many(name: &str) -> Self {
        Self::leaf(name, Cardinality::Many, ElementKind::Primitive)
    }

    pub fn reference(name: &str) -> Self {
        Self::leaf(name, Cardinality::One, ElementKind::Reference)
    }

    pub fn composite(name: &str, children: Vec<ElementDescriptor>) -> Self {
        Self {
            name: name.to_string(),
            cardinality: Cardinality::One,
            kind: ElementKind::Composite,
            children,
            choice_variants: Vec::new(),
            codeable: false,
        }
    }

    pub fn composite_many(name: &str, children: Vec<ElementDescriptor>) -> Self {
        Self {
            cardinality: Cardinality::Many,
            ..Self::composite(name, children)
        }
    }

    pub fn coding(name: &str) -> Self {
        Self {
            codeable: true,
            ..Self::composite(
                name,
                vec![
                    ElementDescriptor::primitive("system"),
                    ElementDescriptor::primitive("version"),
                    ElementDescriptor::primitive("code"),
                    ElementDescriptor::primitive("display"),
                ],
            )
        }
    }

    pub fn coding_many(name: &str) -> Self {
        Self {
            codeable: true,
            ..Self::composite_many(
                name,
                vec![
                    ElementDescriptor::primitive("system"),
                    ElementDescriptor::primitive("version"),
                    ElementDescriptor::primitive("code"),
                    ElementDescriptor::primitive("display"),
                ],
            )
        }
    }

    pub fn codeable_concept(name: &str) -> Self {
        Self::composite(name, vec![ElementDescriptor::coding_many("coding")])
    }

    pub fn contained_many() -> Self {
        Self {
            name: "contained".to_string(),
            cardinality: Cardinality::Many,
            kind: ElementKind::ContainedResource,
            children: Vec::new(),
            choice_variants: Vec::new(),
            codeable: false,
        }
    }

    pub fn choice(name: &str, variants: Vec<ChoiceVariant>) -> Self {
        Self {
            name: name.to_string(),
            cardinality: Cardinality::One,
            kind: ElementKind::Composite,
            children: Vec::new(),
            choice_variants: variants,
            codeable: false,
        }
    }

    pub fn is_choice(&self) -> bool {
        !self.choice_variants.is_empty()
    }
}

fn identifier_schema() -> ElementDescriptor {
    ElementDescriptor::composite_many(
        "identifier",
        vec![
            ElementDescriptor::primitive("system"),
            ElementDescriptor::primitive("value"),
        ],
    )
}

fn human_name_schema() -> ElementDescriptor {
    ElementDescriptor::composite_many(
        "name",
        vec![
            ElementDescriptor::primitive("family"),
            ElementDescriptor::primitive_many("given"),
        ],
    )
}

#[derive(Clone, Debug)]
pub struct ResourceSchema {
    pub resource_type: String,
    pub elements: Vec<ElementDescriptor>,
}

fn patient_schema() -> ResourceSchema {
    ResourceSchema {
        resource_type: "Patient".to_string(),
        elements: vec![
            identifier_schema(),
            ElementDescriptor::primitive("active"),
            human_name_schema(),
            ElementDescriptor::primitive("gender"),
            ElementDescriptor::primitive("birthDate"),
            ElementDescriptor::contained_many(),
        ],
    }
}

fn observation_schema() -> ResourceSchema {
    ResourceSchema {
        resource_type: "Observation".to_string(),
        elements: vec![
            identifier_schema(),
            ElementDescriptor::primitive("status"),
            ElementDescriptor::codeable_concept("code"),
            ElementDescriptor::reference("subject"),
            ElementDescriptor::choice(
                "value[x]",
                vec![
                    ChoiceVariant {
                        field_name: "valueQuantity".to_string(),
                        kind: ElementKind::Composite,
                        children: vec![
                            ElementDescriptor::primitive("value"),
                            ElementDescriptor::primitive("unit"),
                            ElementDescriptor::primitive("system"),
                            ElementDescriptor::primitive("code"),
                        ],
                    },
                    ChoiceVariant {
                        field_name: "valueString".to_string(),
                        kind: ElementKind::Primitive,
                        children: vec![],
                    },
                    ChoiceVariant {
                        field_name: "valueBoolean".to_string(),
                        kind: ElementKind::Primitive,
                        children: vec![],
                    },
                    ChoiceVariant {
                        field_name: "valueCodeableConcept".to_string(),
                        kind: ElementKind::Composite,
                        children: ElementDescriptor::codeable_concept("valueCodeableConcept").children,
                    },
                ],
            ),
            ElementDescriptor::contained_many(),
        ],
    }
}

/// Synthesizes a best-effort schema from the shape of `value` itself, for
/// any `resourceType` with no hand-authored entry. Objects become card-one
/// composites, arrays of objects become card-many composites, arrays of
/// scalars become card-many primitives, everything else is a card-one
/// primitive.
pub fn infer_schema(resource_type: &str, value: &Value) -> ResourceSchema {
    let elements = match value.as_object() {
        Some(obj) => obj
            .iter()
            .filter(|(k, _)| k.as_str() != "resourceType" && k.as_str() != "id" && k.as_str() != "meta")
            .map(|(k, v)| infer_element(k, v))
            .collect(),
        None => Vec::new(),
    };
    ResourceSchema {
        resource_type: resource_type.to_string(),
        elements,
    }
}

fn infer_element(name: &str, value: &Value) -> ElementDescriptor {
    match value {
        Value::Array(items) => match items.first() {
            Some(Value::Object(_)) => {
                let children = items
                    .iter()
                    .filter_map(|v| v.as_object())
                    .flat_map(|obj| obj.iter())
                    .map(|(k, v)| infer_element(k, v))
                    .collect();
                ElementDescriptor::composite_many(name, dedup_by_name(children))
            }
            _ => ElementDescriptor::primitive_many(name),
        },
        Value::Object(obj) => {
            let children = obj.iter().map(|(k, v)| infer_element(k, v)).collect();
            ElementDescriptor::composite(name, children)
        }
        _ => ElementDescriptor::primitive(name),
    }
}

fn dedup_by_name(elements: Vec<ElementDescriptor>) -> Vec<ElementDescriptor> {
    let mut seen = std::collections::HashSet::new();
    elements.into_iter().filter(|e| seen.insert(e.name.clone())).collect()
}

pub struct SchemaTable;

impl SchemaTable {
    pub fn resolve(resource_type: &str, new_value: &Value) -> ResourceSchema {
        match resource_type {
            "Patient" => patient_schema(),
            "Observation" => observation_schema(),
            other => infer_schema(other, new_value),
        }
    }
}
