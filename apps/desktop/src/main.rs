use anyhow::Result;
use clap::Parser;
use grading_api::GradingClient;
use shared::domain::CourseId;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    course_id: String,
    /// Print the previously graded result instead of the exam preamble.
    #[arg(long)]
    last_result: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let client = GradingClient::new(&args.server_url)?;
    let course_id = CourseId::new(args.course_id);

    if args.last_result {
        let result = client.fetch_last_result(&course_id).await?;
        println!(
            "Result: {}/{} ({:.0}%) passed={} credibility={} malpractice={} attempts={}",
            result.score,
            result.total_points,
            result.percentage,
            result.passed,
            result.credibility_score,
            result.malpractice_count,
            result.attempts,
        );
        for item in &result.analysis {
            let mark = if item.correct { "+" } else { "-" };
            println!("  [{mark}] {} ({})", item.question, item.feedback);
        }
        return Ok(());
    }

    let exam = client.fetch_exam(&course_id).await?;
    println!("{} — {}", exam.title, exam.description);
    println!(
        "{} minutes, {} questions, proctored (camera, microphone, fullscreen required)",
        exam.time_limit_minutes,
        exam.questions.len()
    );
    for (idx, question) in exam.questions.iter().enumerate() {
        println!("{}. {}", idx + 1, question.prompt);
        if let Some(options) = &question.options {
            for option in options {
                println!("   - {option}");
            }
        }
    }
    println!("Interactive proctored session driving is TODO in this headless harness.");

    Ok(())
}
