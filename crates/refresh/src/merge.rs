use cairn_core::Entity;

/// Combine the stored entity `base` with a freshly parsed `added`.
///
/// Everything comes from `added` except `uid` and `generation`, which always
/// come from `base`. Annotations are overlaid: keys in `added` win, keys only
/// present in `base` survive.
pub fn merge_entities(base: &Entity, added: &Entity) -> Entity {
    let mut result = added.clone();
    result.metadata.uid = base.metadata.uid.clone();
    result.metadata.generation = base.metadata.generation;

    if !base.metadata.annotations.is_empty() {
        let mut annotations = base.metadata.annotations.clone();
        annotations.extend(std::mem::take(&mut result.metadata.annotations));
        result.metadata.annotations = annotations;
    }
    result
}
