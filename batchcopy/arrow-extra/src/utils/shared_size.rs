use arrow::{
    array::{
        Array, AsArray, GenericByteArray, GenericByteViewArray, GenericListArray,
        OffsetSizeTrait, RecordBatch,
    },
    buffer::{Buffer, NullBuffer, ScalarBuffer},
    datatypes::{ArrowNativeType, ByteArrayType, ByteViewType, DataType},
    downcast_primitive_array,
};

/// Bytes a buffer pins in memory, amortized over every array sharing it.
fn amortized(buffer: &Buffer) -> usize {
    buffer.capacity() / buffer.strong_count()
}

fn scalar<T: ArrowNativeType>(buffer: &ScalarBuffer<T>) -> usize {
    amortized(buffer.inner())
}

fn validity(nulls: Option<&NullBuffer>) -> usize {
    nulls.map(|n| amortized(n.inner().inner())).unwrap_or(0)
}

fn byte_array<T: ByteArrayType>(array: &GenericByteArray<T>) -> usize {
    validity(array.nulls()) + amortized(array.values()) + scalar(array.offsets().inner())
}

fn byte_view_array<T: ByteViewType>(array: &GenericByteViewArray<T>) -> usize {
    validity(array.nulls())
        + scalar(array.views())
        + array.data_buffers().iter().map(amortized).sum::<usize>()
}

fn list_array<O: OffsetSizeTrait>(array: &GenericListArray<O>) -> usize {
    validity(array.nulls())
        + scalar(array.offsets().inner())
        + array_bytes(array.values())
}

/// Byte size of `array`, counting each underlying buffer once no matter how
/// many live arrays reference it.
///
/// Types without an explicit rule fall back to Arrow's own accounting, which
/// may overcount shared buffers but never panics.
pub fn array_bytes(array: &dyn Array) -> usize {
    downcast_primitive_array! {
        array => {
            scalar(array.values()) + validity(array.nulls())
        },
        DataType::Boolean => {
            let array = array.as_boolean();
            amortized(array.values().inner()) + validity(array.nulls())
        }
        DataType::Utf8 => byte_array(array.as_string::<i32>()),
        DataType::LargeUtf8 => byte_array(array.as_string::<i64>()),
        DataType::Binary => byte_array(array.as_binary::<i32>()),
        DataType::LargeBinary => byte_array(array.as_binary::<i64>()),
        DataType::Utf8View => byte_view_array(array.as_string_view()),
        DataType::BinaryView => byte_view_array(array.as_binary_view()),
        DataType::FixedSizeBinary(_) => {
            let array = array.as_fixed_size_binary();
            amortized(array.values()) + validity(array.nulls())
        }
        DataType::List(_) => list_array(array.as_list::<i32>()),
        DataType::LargeList(_) => list_array(array.as_list::<i64>()),
        DataType::FixedSizeList(_, _) => {
            let array = array.as_fixed_size_list();
            array_bytes(array.values()) + validity(array.nulls())
        }
        DataType::Struct(_) => {
            let array = array.as_struct();
            validity(array.nulls())
                + array.columns().iter().map(|c| array_bytes(c)).sum::<usize>()
        }
        DataType::Dictionary(_, _) => {
            let array = array.as_any_dictionary();
            array_bytes(array.keys()) + array_bytes(array.values())
        }
        _ => array.get_array_memory_size(),
    }
}

/// Byte size of a record batch under shared-buffer accounting.
pub fn batch_bytes(batch: &RecordBatch) -> usize {
    batch.columns().iter().map(|c| array_bytes(c)).sum()
}
