//! Decodes the objects carried by an admission request into typed or unstructured objects and
//! produces JSON patches between two object states.
use kube::core::{
    DynamicObject,
    admission::{AdmissionRequest, AdmissionResponse, Operation},
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum CodecError {
    #[snafu(display("admission request for {operation:?} carries no {which} object"))]
    MissingObject {
        operation: Operation,
        which: &'static str,
    },

    #[snafu(display("failed to decode {which} object into {type_name}"))]
    DecodeObject {
        source: serde_json::Error,
        which: &'static str,
        type_name: &'static str,
    },

    #[snafu(display("failed to serialize object to compute a patch"))]
    SerializeObject { source: serde_json::Error },

    #[snafu(display("failed to serialize JSON patch into the admission response"))]
    SerializePatch {
        source: kube::core::admission::SerializePatchError,
    },
}

/// Decodes the new object of a request, or the old object for deletes which don't carry a new
/// one.
pub fn decode_object<K>(request: &AdmissionRequest<DynamicObject>) -> Result<K, CodecError>
where
    K: DeserializeOwned,
{
    let (object, which) = match request.operation {
        Operation::Delete => (request.old_object.as_ref(), "old"),
        _ => (request.object.as_ref(), "new"),
    };

    let object = object.with_context(|| MissingObjectSnafu {
        operation: request.operation.clone(),
        which,
    })?;

    convert(object, which)
}

/// Decodes both the old and the new object of a request. Either one is `None` when the request
/// doesn't carry it, e.g. there is no old object on create.
pub fn decode_old_and_new<K>(
    request: &AdmissionRequest<DynamicObject>,
) -> Result<(Option<K>, Option<K>), CodecError>
where
    K: DeserializeOwned,
{
    let old = request
        .old_object
        .as_ref()
        .map(|object| convert(object, "old"))
        .transpose()?;
    let new = request
        .object
        .as_ref()
        .map(|object| convert(object, "new"))
        .transpose()?;

    Ok((old, new))
}

/// Computes the RFC 6902 patch which turns `old` into `new`.
pub fn create_patch<T>(old: &T, new: &T) -> Result<json_patch::Patch, CodecError>
where
    T: Serialize,
{
    let old = serde_json::to_value(old).context(SerializeObjectSnafu)?;
    let new = serde_json::to_value(new).context(SerializeObjectSnafu)?;

    Ok(json_patch::diff(&old, &new))
}

/// Attaches the patch turning `old` into `new` to `response`. The response is returned
/// unchanged if both states are equal.
pub fn patch_response<T>(
    response: AdmissionResponse,
    old: &T,
    new: &T,
) -> Result<AdmissionResponse, CodecError>
where
    T: Serialize,
{
    let patch = create_patch(old, new)?;

    if patch.0.is_empty() {
        return Ok(response);
    }

    response.with_patch(patch).context(SerializePatchSnafu)
}

fn convert<K>(object: &DynamicObject, which: &'static str) -> Result<K, CodecError>
where
    K: DeserializeOwned,
{
    let decode_context = || DecodeObjectSnafu {
        which,
        type_name: std::any::type_name::<K>(),
    };

    let value = serde_json::to_value(object).with_context(|_| decode_context())?;
    serde_json::from_value(value).with_context(|_| decode_context())
}
