use std::sync::Arc;

use anyhow::Result;
use infer_rs::{CpuRuntime, DType, Graph, Shape};

fn main() -> Result<()> {
    let runtime = Arc::new(CpuRuntime::new());
    let mut graph = Graph::new(runtime);

    // x @ transpose(w) followed by an activation; the optimizer folds the
    // transpose into the matmul's flag.
    let x = graph.add_tensor(Shape::new([4, 8, 16]), DType::F32);
    let w = graph.add_tensor(Shape::new([4, 32, 16]), DType::F32);
    let wt = graph.transpose(w, vec![0, 2, 1])?;
    let mm = graph.matmul(x, graph.op_output(wt, 0), false, false)?;
    graph.relu(graph.op_output(mm, 0))?;

    graph.topo_sort()?;
    graph.shape_infer()?;
    graph.optimize();
    graph.data_malloc()?;
    graph.check_valid()?;

    let x_data = vec![0.5f32; 4 * 8 * 16];
    graph.tensor(x).fill(&x_data);

    println!("{graph}");
    println!("memory: {}", graph.allocator().info());
    Ok(())
}
