use kube::runtime::predicates;
use kube::ResourceExt;

/// Trigger on spec changes only, except while an object is being deleted,
/// where every resource version counts.
pub fn generation_with_deletion(obj: &impl ResourceExt) -> Option<u64> {
    if obj.meta().deletion_timestamp.is_some() {
        return predicates::resource_version(obj);
    }
    predicates::generation(obj)
}
