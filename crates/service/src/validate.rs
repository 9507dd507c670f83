use regent_core::{ResourceId, Status, Tenancy, Type, WILDCARD};
use regent_registry::{validate_name, ValidationError};

pub(crate) fn validate_type(field: &str, ty: &Type) -> Result<(), ValidationError> {
    if ty.is_empty() {
        return Err(ValidationError::missing(field));
    }
    if ty.group.is_empty() {
        return Err(ValidationError::missing(format!("{field}.group")));
    }
    if ty.group_version.is_empty() {
        return Err(ValidationError::missing(format!("{field}.group_version")));
    }
    if ty.kind.is_empty() {
        return Err(ValidationError::missing(format!("{field}.kind")));
    }
    Ok(())
}

/// Empty units are allowed (they are defaulted later); set units must be names.
pub(crate) fn validate_tenancy(field: &str, tenancy: &Tenancy, allow_wildcard: bool) -> Result<(), ValidationError> {
    for (unit, value) in [("partition", &tenancy.partition), ("namespace", &tenancy.namespace)] {
        if value.is_empty() || (allow_wildcard && value == WILDCARD) {
            continue;
        }
        validate_name(&format!("{field}.tenancy.{unit}"), value)?;
    }
    Ok(())
}

pub(crate) fn validate_id(field: &str, id: &ResourceId) -> Result<(), ValidationError> {
    validate_type(&format!("{field}.type"), &id.ty)?;
    validate_tenancy(field, &id.tenancy, false)?;
    validate_name(&format!("{field}.name"), &id.name)
}

pub(crate) fn validate_status(status: &Status) -> Result<(), ValidationError> {
    if status.observed_generation == 0 {
        return Err(ValidationError::missing("status.observed_generation"));
    }
    let mut seen: Vec<&str> = Vec::with_capacity(status.conditions.len());
    for (i, cond) in status.conditions.iter().enumerate() {
        let field = format!("status.conditions[{i}].type");
        if cond.ty.is_empty() {
            return Err(ValidationError::missing(field));
        }
        if seen.contains(&cond.ty.as_str()) {
            return Err(ValidationError::invalid(field, format!("duplicate condition type {:?}", cond.ty)));
        }
        seen.push(&cond.ty);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use regent_core::{Condition, ConditionState};

    fn id(name: &str) -> ResourceId {
        ResourceId::new(Type::new("demo", "v1", "Thing"), Tenancy::default(), name)
    }

    #[test]
    fn ids() {
        assert!(validate_id("id", &id("web")).is_ok());
        assert_eq!(validate_id("id", &id("")), Err(ValidationError::missing("id.name")));

        let mut no_kind = id("web");
        no_kind.ty.kind.clear();
        assert_eq!(validate_id("id", &no_kind), Err(ValidationError::missing("id.type.kind")));

        let mut wild = id("web");
        wild.tenancy = Tenancy::wildcard();
        assert!(validate_id("id", &wild).is_err());
        assert!(validate_tenancy("req", &Tenancy::wildcard(), true).is_ok());
    }

    #[test]
    fn statuses() {
        let cond = |ty: &str| Condition { ty: ty.into(), state: ConditionState::True, ..Default::default() };
        let mut s = Status { observed_generation: 1, conditions: [cond("Healthy"), cond("Ready")].into_iter().collect() };
        assert!(validate_status(&s).is_ok());

        s.conditions.push(cond("Healthy"));
        assert!(matches!(validate_status(&s), Err(ValidationError::Invalid { .. })));

        s.conditions.clear();
        s.observed_generation = 0;
        assert_eq!(validate_status(&s), Err(ValidationError::missing("status.observed_generation")));
    }
}
