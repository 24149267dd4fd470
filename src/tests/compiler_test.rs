#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::feature::compiler::{select_features, CompiledSpec, SpecError};
    use crate::template::IeType;
    use crate::tests::support::compile;

    #[test]
    fn unknown_features_are_rejected() {
        let err = CompiledSpec::compile(&json!(["noSuchFeature"])).unwrap_err();
        assert!(matches!(err, SpecError::Unknown(name) if name == "noSuchFeature"));
    }

    #[test]
    fn selections_cannot_be_exported() {
        let err = CompiledSpec::compile(&json!([
            {"select": [{"geq": ["octetTotalCount", 100]}]}
        ]))
        .unwrap_err();
        assert!(matches!(err, SpecError::Kind { .. }));
    }

    #[test]
    fn flow_features_are_rejected_as_packet_input() {
        let err = CompiledSpec::compile(&json!([{"mean": ["packetTotalCount"]}])).unwrap_err();
        assert!(matches!(err, SpecError::Kind { .. }));
    }

    #[test]
    fn arity_errors_name_the_feature() {
        let err = CompiledSpec::compile(&json!([{"geq": ["octetTotalCount"]}])).unwrap_err();
        assert!(matches!(err, SpecError::Overload { feature } if feature.contains("geq")));
    }

    #[test]
    fn template_carries_iana_ids_and_temporaries() {
        let spec = compile(
            r#"["sourceIPv4Address", "destinationIPv4Address", "packetTotalCount",
                {"apply": ["mean", "octetTotalCount"]}]"#,
        );
        let template = spec.template();
        let elements = &template.elements;
        assert_eq!(elements.len(), 4);
        assert_eq!(elements[0].id, 8);
        assert_eq!(elements[0].ty, IeType::Ipv4Address);
        assert_eq!(elements[1].id, 12);
        assert_eq!(elements[2].id, 86);
        assert_eq!(elements[2].ty, IeType::Unsigned64);
        // composite feature: temporary element named by its spelling
        assert_eq!(elements[3].id, 0);
        assert_eq!(elements[3].pen, 0);
        assert_eq!(elements[3].name, "apply(mean, octetTotalCount)");
        assert_eq!(elements[3].ty, IeType::Float64);
    }

    #[test]
    fn same_spec_shares_one_template() {
        let spec = compile(r#"["packetTotalCount"]"#);
        let a = spec.template();
        let b = spec.instantiate();
        assert_eq!(a.id, b.template().id);
        assert_eq!(a.elements, b.template().elements);
    }

    #[test]
    fn selection_lookup_by_id_and_position() {
        let doc = json!({
            "flows": [
                {"id": 0, "features": ["packetTotalCount"]},
                {"id": 3, "features": ["octetTotalCount"]},
            ],
            "other": [
                {"features": ["count"]},
            ],
        });
        let by_id = select_features(&doc, "flows", 3).unwrap();
        assert_eq!(by_id, json!(["octetTotalCount"]));
        let by_position = select_features(&doc, "other", 0).unwrap();
        assert_eq!(by_position, json!(["count"]));

        assert!(matches!(
            select_features(&doc, "flows", 7),
            Err(SpecError::SelectionNotFound(_))
        ));
        assert!(matches!(
            select_features(&doc, "missing", 0),
            Err(SpecError::SelectionNotFound(_))
        ));
    }

    #[test]
    fn boolean_and_reason_element_types() {
        let spec = compile(r#"[{"geq": ["octetTotalCount", 100]}, "flowEndReason"]"#);
        let template = spec.template();
        assert_eq!(template.elements[0].ty, IeType::Boolean);
        assert_eq!(template.elements[1].id, 136);
        assert_eq!(template.elements[1].length, 1);
    }

    #[test]
    fn constant_division_by_zero_fails_compilation() {
        let err = CompiledSpec::compile(&json!([{"divide": [4, 0]}])).unwrap_err();
        assert!(matches!(err, SpecError::Invalid(_)));
    }
}
